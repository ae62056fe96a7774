/// A tokenized command line awaiting authorization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRequest {
    /// Original line with the `/` marker stripped. Used verbatim for
    /// shell-interpreted executables.
    pub raw: String,
    pub argv: Vec<String>,
}

/// Routed inbound message. A bare line and the same line prefixed with `/`
/// parse identically; a handful of keywords are reserved for the bot itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Start,
    Help,
    /// `auth <secret>`; `None` when the secret argument is missing.
    Auth(Option<String>),
    Stop,
    Command(CommandRequest),
    Empty,
}

pub fn parse_message(text: &str) -> Inbound {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Inbound::Empty;
    }

    // Optional `/` marker; `/ls -la` and `ls -la` are the same command.
    let line = trimmed.strip_prefix('/').unwrap_or(trimmed);
    let argv = split_shell_words(line);
    let Some(first) = argv.first() else {
        return Inbound::Empty;
    };

    match first.as_str() {
        "start" => Inbound::Start,
        "help" => Inbound::Help,
        "stop" => Inbound::Stop,
        "auth" => Inbound::Auth(argv.get(1).cloned()),
        _ => Inbound::Command(CommandRequest {
            raw: line.to_string(),
            argv,
        }),
    }
}

/// Minimal shell-like word splitting: single/double quotes and backslash
/// escapes outside single quotes. No expansion of any kind.
pub fn split_shell_words(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars().peekable();

    let mut in_single = false;
    let mut in_double = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
            }
            '"' if !in_single => {
                in_double = !in_double;
            }
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !cur.is_empty() {
                    out.push(cur);
                    cur = String::new();
                }
            }
            other => {
                cur.push(other);
            }
        }
    }

    if !cur.is_empty() {
        out.push(cur);
    }

    out
}
