//! Declarative pipeline scripts.
//!
//! ```text
//! pipeline {
//!     agent none | any | { docker 'image' }
//!     stages {
//!         stage('Name') {
//!             agent ...                  (optional)
//!             steps { sh 'make' ... }    (optional)
//!             failFast true|false        (optional)
//!             parallel { stage(...) }    (optional)
//!         }
//!     }
//! }
//! ```
//!
//! A step is a command followed by either one string (`sh 'make'`,
//! `sh('make')`) or `key: 'value'` pairs (`git url: '...', branch: 'main'`).
//! Strings are single, double or triple quoted; `//` starts a line comment.

use std::collections::HashSet;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while},
    character::complete::{char, multispace1, satisfy},
    combinator::{all_consuming, cut, map, not, opt, recognize, value},
    error::{context, ContextError, ParseError as NomParseError},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult,
};

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub agent: Agent,
    pub stages: Vec<Stage>,
}

/// Where a stage's steps execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Agent {
    Any,
    None,
    Docker(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    /// Overrides the enclosing agent when set.
    pub agent: Option<Agent>,
    pub steps: Vec<Step>,
    /// Cancel the remaining parallel branches on the first failure.
    pub fail_fast: bool,
    pub parallel: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: String,
    pub args: StepArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepArgs {
    Text(String),
    Params(Vec<(String, String)>),
}

impl Step {
    /// The single string argument, or the named parameter `key`.
    pub fn argument(&self, key: &str) -> Option<&str> {
        match &self.args {
            StepArgs::Text(text) => Some(text),
            StepArgs::Params(params) => params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
        }
    }
}

impl Pipeline {
    /// Every step in the pipeline, parallel branches included.
    pub fn steps(&self) -> Vec<&Step> {
        fn collect<'a>(stages: &'a [Stage], out: &mut Vec<&'a Step>) {
            for stage in stages {
                collect(&stage.parallel, out);
                out.extend(&stage.steps);
            }
        }
        let mut out = Vec::new();
        collect(&self.stages, &mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ScriptError(String);

// ============================================================================
// Public API
// ============================================================================

/// Parse a pipeline script.
///
/// Besides syntax, rejects stages with neither steps nor parallel branches
/// and duplicate stage names within one block, since results are keyed by
/// stage name.
pub fn parse_pipeline(input: &str) -> Result<Pipeline, ScriptError> {
    let pipeline = match all_consuming(pipeline::<nom::error::VerboseError<&str>>)(input) {
        Ok((_, pipeline)) => pipeline,
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(ScriptError(nom::error::convert_error(input, e)))
        }
        Err(nom::Err::Incomplete(_)) => return Err(ScriptError("Incomplete script".into())),
    };
    check_stages(&pipeline.stages)?;
    Ok(pipeline)
}

fn check_stages(stages: &[Stage]) -> Result<(), ScriptError> {
    let mut seen = HashSet::new();
    for stage in stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(ScriptError(format!("Duplicate stage '{}'", stage.name)));
        }
        if stage.steps.is_empty() && stage.parallel.is_empty() {
            return Err(ScriptError(format!(
                "Stage '{}' has neither steps nor parallel branches",
                stage.name
            )));
        }
        check_stages(&stage.parallel)?;
    }
    Ok(())
}

// ============================================================================
// Structure
// ============================================================================

fn pipeline<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Pipeline, E> {
    let (input, _) = keyword("pipeline")(input)?;
    let (input, _) = cut(symbol('{'))(input)?;
    let (input, agent) = cut(context("agent", agent))(input)?;
    let (input, _) = cut(context("stages", keyword("stages")))(input)?;
    let (input, stages) = cut(block(many1(stage)))(input)?;
    let (input, _) = cut(context("end of pipeline", symbol('}')))(input)?;
    let (input, _) = ws(input)?;
    Ok((input, Pipeline { agent, stages }))
}

fn stage<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Stage, E> {
    let (input, _) = keyword("stage")(input)?;
    let (input, name) = cut(context(
        "stage name",
        delimited(symbol('('), string_literal, symbol(')')),
    ))(input)?;
    let (input, _) = cut(symbol('{'))(input)?;
    let (input, agent) = opt(agent)(input)?;
    let (input, steps) = opt(preceded(keyword("steps"), cut(block(many1(step)))))(input)?;
    let (input, fail_fast) = opt(preceded(keyword("failFast"), cut(boolean)))(input)?;
    let (input, parallel) = opt(preceded(keyword("parallel"), cut(block(many1(stage)))))(input)?;
    let (input, _) = cut(context("end of stage", symbol('}')))(input)?;

    Ok((
        input,
        Stage {
            name,
            agent,
            steps: steps.unwrap_or_default(),
            fail_fast: fail_fast.unwrap_or(false),
            parallel: parallel.unwrap_or_default(),
        },
    ))
}

fn agent<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Agent, E> {
    preceded(
        keyword("agent"),
        cut(alt((
            value(Agent::None, keyword("none")),
            value(Agent::Any, keyword("any")),
            map(
                block(preceded(keyword("docker"), cut(string_literal))),
                Agent::Docker,
            ),
        ))),
    )(input)
}

fn step<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Step, E> {
    let (input, command) = preceded(ws, identifier)(input)?;
    let (input, args) = cut(context(
        "step arguments",
        alt((
            map(
                delimited(symbol('('), params, symbol(')')),
                StepArgs::Params,
            ),
            map(
                delimited(symbol('('), string_literal, symbol(')')),
                StepArgs::Text,
            ),
            map(params, StepArgs::Params),
            map(string_literal, StepArgs::Text),
        )),
    ))(input)?;
    Ok((
        input,
        Step {
            command: command.to_string(),
            args,
        },
    ))
}

fn params<'a, E: NomParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Vec<(String, String)>, E> {
    separated_list1(
        symbol(','),
        separated_pair(
            map(preceded(ws, identifier), |key: &str| key.to_string()),
            symbol(':'),
            string_literal,
        ),
    )(input)
}

fn block<'a, O, E: NomParseError<&'a str>>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O, E>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(symbol('{'), inner, symbol('}'))
}

// ============================================================================
// Tokens
// ============================================================================

fn ws<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, (), E> {
    value((), many0(alt((multispace1, line_comment))))(input)
}

fn line_comment<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, &'a str, E> {
    recognize(pair(tag("//"), take_while(|c: char| c != '\n')))(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, &'a str, E> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

/// `kw` as a whole word, after optional whitespace.
fn keyword<'a, E: NomParseError<&'a str>>(
    kw: &'static str,
) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str, E> {
    preceded(ws, terminated(tag(kw), not(satisfy(is_ident_char))))
}

fn symbol<'a, E: NomParseError<&'a str>>(
    c: char,
) -> impl FnMut(&'a str) -> IResult<&'a str, char, E> {
    preceded(ws, char(c))
}

fn boolean<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, bool, E> {
    alt((
        value(true, keyword("true")),
        value(false, keyword("false")),
    ))(input)
}

fn string_literal<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, String, E> {
    let (input, _) = ws(input)?;
    let (input, text) = alt((
        delimited(tag("'''"), take_until("'''"), tag("'''")),
        delimited(tag("\"\"\""), take_until("\"\"\""), tag("\"\"\"")),
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
    ))(input)?;
    Ok((input, text.trim().to_string()))
}

// ============================================================================
// Tests
// ============================================================================
