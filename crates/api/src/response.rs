//! Success envelope shared by every JSON endpoint except `/health`.

use serde::Serialize;

/// `{ "data": T }`.
///
/// ```ignore
/// Ok(Json(DataResponse { data: summaries }))
/// ```
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}
