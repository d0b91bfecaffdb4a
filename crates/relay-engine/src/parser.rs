//! Command-line grammar for the coordination channel.
//!
//! ```text
//! <prefix> help | status | agents | capabilities | sessions
//! <prefix> cancel <sessionId>
//! <prefix> ask <agentId> "<query>"
//! <prefix> chain <id1>-><id2>[->...] "<seed input>"
//! ```
//!
//! `<prefix>` is the configured command prefix or a mention of the
//! orchestrator (`@orchestrator`, optionally followed by `:`). A bare prefix
//! is `help`.

use tracing::debug;

use relay_core::command::{AdminCommand, Chain, Invocation, ParsedCommand, ASK_COMMAND};
use relay_core::ids::SessionId;

/// Why a line could not be turned into a command.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    EmptyInput,

    /// Ordinary chat traffic.
    #[error("not a command")]
    NotACommand,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("unexpected text after closing quote: {0}")]
    TrailingInput(String),

    #[error("chain has no steps")]
    EmptyChain,

    #[error("invalid agent id: {0:?}")]
    InvalidAgentId(String),
}

impl ParseError {
    /// Errors that should not be answered at all.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::EmptyInput | Self::NotACommand)
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::NotACommand => "not_a_command",
            Self::UnknownCommand(_) => "unknown_command",
            Self::MissingArgument { .. } => "missing_argument",
            Self::UnterminatedQuote => "unterminated_quote",
            Self::TrailingInput(_) => "trailing_input",
            Self::EmptyChain => "empty_chain",
            Self::InvalidAgentId(_) => "invalid_agent_id",
        }
    }
}

/// Agent ids are `[A-Za-z0-9_.-]+`.
pub fn is_valid_agent_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub struct CommandParser {
    prefix: String,
    mention: String,
}

impl CommandParser {
    pub fn new(prefix: impl Into<String>, orchestrator_id: &str) -> Self {
        Self {
            prefix: prefix.into(),
            mention: format!("@{orchestrator_id}"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn parse(&self, text: &str, channel: &str, user: &str) -> Result<ParsedCommand, ParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::EmptyInput);
        }
        let rest = self.strip_prefix(text).ok_or(ParseError::NotACommand)?;
        let parsed = parse_body(rest)?;
        debug!(channel, user, command = ?parsed, "parsed command");
        Ok(parsed)
    }

    /// Remaining text after a recognized prefix, or `None`.
    fn strip_prefix<'a>(&self, text: &'a str) -> Option<&'a str> {
        let rest = strip_word_ci(text, &self.prefix).or_else(|| strip_word_ci(text, &self.mention))?;
        Some(rest.strip_prefix(':').unwrap_or(rest).trim_start())
    }
}

/// Strip `word` case-insensitively when followed by whitespace, `:` or end.
fn strip_word_ci<'a>(text: &'a str, word: &str) -> Option<&'a str> {
    let head = text.get(..word.len())?;
    if !head.eq_ignore_ascii_case(word) {
        return None;
    }
    let rest = &text[word.len()..];
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() || c == ':' => Some(rest.trim_start()),
        Some(_) => None,
    }
}

fn parse_body(body: &str) -> Result<ParsedCommand, ParseError> {
    let (keyword, rest) = split_token(body);
    let keyword = keyword.to_ascii_lowercase();

    let admin = |cmd: AdminCommand| -> Result<ParsedCommand, ParseError> { Ok(ParsedCommand::Admin(cmd)) };
    match keyword.as_str() {
        "" | "help" => admin(AdminCommand::Help),
        "status" => admin(AdminCommand::Status),
        "agents" => admin(AdminCommand::Agents),
        "capabilities" => admin(AdminCommand::Capabilities),
        "sessions" => admin(AdminCommand::Sessions),
        "cancel" => {
            let (id, _) = split_token(rest);
            if id.is_empty() {
                return Err(ParseError::MissingArgument {
                    command: "cancel",
                    argument: "a session id",
                });
            }
            admin(AdminCommand::Cancel(SessionId::from_raw(id)))
        }
        "ask" => {
            let (agent_id, rest) = split_token(rest);
            if agent_id.is_empty() || agent_id.starts_with('"') {
                return Err(ParseError::MissingArgument {
                    command: "ask",
                    argument: "an agent id",
                });
            }
            check_agent_id(agent_id)?;
            let query = parse_text(rest, "ask", "a query")?;
            Ok(ParsedCommand::Ask(Invocation {
                agent_id: agent_id.to_string(),
                command: ASK_COMMAND.to_string(),
                args: query,
            }))
        }
        "chain" => {
            let (spec, rest) = split_chain_spec(rest);
            if spec.is_empty() || spec.starts_with('"') {
                return Err(ParseError::EmptyChain);
            }
            let ids: Vec<&str> = spec.split("->").map(str::trim).collect();
            if ids.iter().all(|id| id.is_empty()) {
                return Err(ParseError::EmptyChain);
            }
            for id in &ids {
                check_agent_id(id)?;
            }
            let seed = parse_text(rest, "chain", "seed input")?;
            Ok(ParsedCommand::Chain(Chain::new(ids, seed)))
        }
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn check_agent_id(id: &str) -> Result<(), ParseError> {
    if is_valid_agent_id(id) {
        Ok(())
    } else {
        Err(ParseError::InvalidAgentId(id.to_string()))
    }
}

/// First whitespace-delimited token and the trimmed remainder.
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

/// The `a->b->c` agent list, which may have spaces around its arrows.
fn split_chain_spec(s: &str) -> (String, &str) {
    let (first, mut rest) = split_token(s);
    let mut spec = first.to_string();
    while !rest.is_empty() && !rest.starts_with('"') && (spec.ends_with("->") || rest.starts_with("->")) {
        let (token, next) = split_token(rest);
        spec.push_str(token);
        rest = next;
    }
    (spec, rest)
}

/// A quoted string (with `\"` and `\\` escapes) or the bare rest of the line.
fn parse_text(s: &str, command: &'static str, argument: &'static str) -> Result<String, ParseError> {
    let s = s.trim();
    let text = match s.strip_prefix('"') {
        Some(quoted) => {
            let (text, consumed) = unquote(quoted)?;
            let trailing = quoted[consumed..].trim();
            if !trailing.is_empty() {
                return Err(ParseError::TrailingInput(trailing.to_string()));
            }
            text
        }
        None => s.to_string(),
    };
    if text.trim().is_empty() {
        return Err(ParseError::MissingArgument { command, argument });
    }
    Ok(text)
}

/// Read up to the closing quote. Returns the text and bytes consumed,
/// including the closing quote.
fn unquote(s: &str) -> Result<(String, usize), ParseError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, i + 1)),
            '\\' => match chars.next() {
                Some((_, e @ ('"' | '\\'))) => out.push(e),
                Some((_, other)) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return Err(ParseError::UnterminatedQuote),
            },
            c => out.push(c),
        }
    }
    Err(ParseError::UnterminatedQuote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::command::CHAIN_STEP_COMMAND;

    fn parser() -> CommandParser {
        CommandParser::new("!orchestrator", "orchestrator")
    }

    fn parse(text: &str) -> Result<ParsedCommand, ParseError> {
        parser().parse(text, "#agents", "alice")
    }

    #[test]
    fn ask_with_quoted_query() {
        let cmd = parse(r#"!orchestrator ask llm "2+2""#).unwrap();
        assert_eq!(
            cmd,
            ParsedCommand::Ask(Invocation {
                agent_id: "llm".into(),
                command: "ask".into(),
                args: "2+2".into(),
            })
        );
    }

    #[test]
    fn ask_with_unquoted_query_takes_rest_of_line() {
        let cmd = parse("!orchestrator ask llm what is   rust?  ").unwrap();
        let ParsedCommand::Ask(inv) = cmd else {
            panic!("expected ask");
        };
        assert_eq!(inv.args, "what is   rust?");
    }

    #[test]
    fn chain_preserves_order_and_seed() {
        let cmd = parse(r#"!orchestrator chain a->b->c "homelab automation""#).unwrap();
        let ParsedCommand::Chain(chain) = cmd else {
            panic!("expected chain");
        };
        assert_eq!(chain.agent_ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(chain.seed, "homelab automation");
        assert!(chain.steps.iter().all(|s| s.command == CHAIN_STEP_COMMAND));
    }

    #[test]
    fn chain_arrows_may_be_spaced() {
        let expected = parse(r#"!orchestrator chain search->llm->writer "rust""#).unwrap();
        for text in [
            r#"!orchestrator chain search -> llm -> writer "rust""#,
            r#"!orchestrator chain search ->llm-> writer "rust""#,
            r#"!orchestrator chain search-> llm ->writer rust"#,
        ] {
            assert_eq!(parse(text).unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn dangling_arrow_before_seed_is_invalid() {
        assert_eq!(
            parse(r#"!orchestrator chain search -> "rust""#).unwrap_err(),
            ParseError::InvalidAgentId(String::new())
        );
    }

    #[test]
    fn single_step_chain_is_allowed() {
        let cmd = parse(r#"!orchestrator chain search "x""#).unwrap();
        assert_eq!(cmd.agent_ids(), vec!["search"]);
    }

    #[test]
    fn admin_keywords_case_insensitive() {
        assert_eq!(parse("!orchestrator STATUS").unwrap(), ParsedCommand::Admin(AdminCommand::Status));
        assert_eq!(parse("!Orchestrator agents").unwrap(), ParsedCommand::Admin(AdminCommand::Agents));
        assert_eq!(
            parse("!orchestrator Capabilities").unwrap(),
            ParsedCommand::Admin(AdminCommand::Capabilities)
        );
        assert_eq!(parse("!orchestrator sessions").unwrap(), ParsedCommand::Admin(AdminCommand::Sessions));
    }

    #[test]
    fn bare_prefix_is_help() {
        assert_eq!(parse("!orchestrator").unwrap(), ParsedCommand::Admin(AdminCommand::Help));
        assert_eq!(parse("  !orchestrator  help ").unwrap(), ParsedCommand::Admin(AdminCommand::Help));
    }

    #[test]
    fn mention_prefix() {
        assert_eq!(parse("@orchestrator status").unwrap(), ParsedCommand::Admin(AdminCommand::Status));
        assert_eq!(parse("@orchestrator: agents").unwrap(), ParsedCommand::Admin(AdminCommand::Agents));
        assert_eq!(parse("@orchestrator:").unwrap(), ParsedCommand::Admin(AdminCommand::Help));
    }

    #[test]
    fn cancel_takes_session_id() {
        assert_eq!(
            parse("!orchestrator cancel sess_123").unwrap(),
            ParsedCommand::Admin(AdminCommand::Cancel(SessionId::from_raw("sess_123")))
        );
        assert!(matches!(
            parse("!orchestrator cancel"),
            Err(ParseError::MissingArgument { command: "cancel", .. })
        ));
    }

    #[test]
    fn plain_chat_is_not_a_command() {
        let err = parse("hello everyone").unwrap_err();
        assert_eq!(err, ParseError::NotACommand);
        assert!(err.is_silent());
        // prefix must be a whole word
        assert_eq!(parse("!orchestratorx status").unwrap_err(), ParseError::NotACommand);
        assert_eq!(parse("@orchestrators hi").unwrap_err(), ParseError::NotACommand);
    }

    #[test]
    fn empty_input() {
        assert_eq!(parse("   ").unwrap_err(), ParseError::EmptyInput);
    }

    #[test]
    fn unknown_command() {
        let err = parse("!orchestrator dance").unwrap_err();
        assert_eq!(err, ParseError::UnknownCommand("dance".into()));
        assert!(!err.is_silent());
    }

    #[test]
    fn malformed_quoting() {
        assert_eq!(
            parse(r#"!orchestrator ask llm "unterminated"#).unwrap_err(),
            ParseError::UnterminatedQuote
        );
        assert_eq!(
            parse(r#"!orchestrator ask llm "a" b"#).unwrap_err(),
            ParseError::TrailingInput("b".into())
        );
    }

    #[test]
    fn escapes_inside_quotes() {
        let cmd = parse(r#"!orchestrator ask llm "say \"hi\" \\ \n""#).unwrap();
        let ParsedCommand::Ask(inv) = cmd else {
            panic!("expected ask");
        };
        assert_eq!(inv.args, r#"say "hi" \ \n"#);
    }

    #[test]
    fn empty_chain() {
        assert_eq!(parse(r#"!orchestrator chain "seed""#).unwrap_err(), ParseError::EmptyChain);
        assert_eq!(parse("!orchestrator chain").unwrap_err(), ParseError::EmptyChain);
        assert_eq!(parse(r#"!orchestrator chain -> "seed""#).unwrap_err(), ParseError::EmptyChain);
    }

    #[test]
    fn chain_with_empty_segment_is_invalid() {
        assert_eq!(
            parse(r#"!orchestrator chain a->->b "x""#).unwrap_err(),
            ParseError::InvalidAgentId(String::new())
        );
    }

    #[test]
    fn invalid_agent_ids() {
        assert_eq!(
            parse(r#"!orchestrator ask ll$m "x""#).unwrap_err(),
            ParseError::InvalidAgentId("ll$m".into())
        );
        assert!(is_valid_agent_id("web-search.v2_b"));
        assert!(!is_valid_agent_id(""));
    }

    #[test]
    fn missing_query() {
        assert!(matches!(
            parse("!orchestrator ask llm").unwrap_err(),
            ParseError::MissingArgument { command: "ask", .. }
        ));
        assert!(matches!(
            parse(r#"!orchestrator ask llm """#).unwrap_err(),
            ParseError::MissingArgument { command: "ask", .. }
        ));
        assert!(matches!(
            parse(r#"!orchestrator ask "2+2""#).unwrap_err(),
            ParseError::MissingArgument { argument: "an agent id", .. }
        ));
    }

    #[test]
    fn custom_prefix() {
        let parser = CommandParser::new("!bot", "coord");
        assert_eq!(
            parser.parse("!bot status", "#c", "u").unwrap(),
            ParsedCommand::Admin(AdminCommand::Status)
        );
        assert_eq!(
            parser.parse("@coord help", "#c", "u").unwrap(),
            ParsedCommand::Admin(AdminCommand::Help)
        );
        assert_eq!(parser.parse("!orchestrator status", "#c", "u").unwrap_err(), ParseError::NotACommand);
    }
}
