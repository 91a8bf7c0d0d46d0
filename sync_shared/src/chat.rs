//! Chat line handling.
//!
//! Chat text travels as a plain string. A line that starts with `/` is a
//! command: the first whitespace-delimited token (minus the slash) is the
//! command name and the remaining tokens are its arguments.

/// Maximum message length in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 1023;

/// Non-empty and within [`MAX_MESSAGE_LENGTH`].
pub fn is_valid_message(text: &str) -> bool {
    !text.is_empty() && text.len() <= MAX_MESSAGE_LENGTH
}

/// A parsed chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatLine<'a> {
    Message(&'a str),
    Command { command: &'a str, args: Vec<&'a str> },
}

impl<'a> ChatLine<'a> {
    pub fn parse(text: &'a str) -> Self {
        let Some(rest) = text.strip_prefix('/') else {
            return ChatLine::Message(text);
        };
        // A space right after the slash leaves the command name empty.
        let (command, tail) = match rest.find(char::is_whitespace) {
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, ""),
        };
        ChatLine::Command {
            command,
            args: tail.split_whitespace().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(ChatLine::parse("hello"), ChatLine::Message("hello"));
    }

    #[test]
    fn slash_line_is_a_command() {
        assert_eq!(
            ChatLine::parse("/kick alice reason"),
            ChatLine::Command {
                command: "kick",
                args: vec!["alice", "reason"]
            }
        );
    }

    #[test]
    fn extra_whitespace_is_collapsed() {
        assert_eq!(
            ChatLine::parse("/time   14  30 "),
            ChatLine::Command {
                command: "time",
                args: vec!["14", "30"]
            }
        );
    }

    #[test]
    fn bare_slash_has_empty_command() {
        assert_eq!(
            ChatLine::parse("/"),
            ChatLine::Command {
                command: "",
                args: vec![]
            }
        );
    }

    #[test]
    fn length_limits() {
        assert!(!is_valid_message(""));
        assert!(is_valid_message(&"a".repeat(MAX_MESSAGE_LENGTH)));
        assert!(!is_valid_message(&"a".repeat(MAX_MESSAGE_LENGTH + 1)));
    }
}
