use std::{path::PathBuf, str::FromStr};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Next,
    Back,
    Notes(String),
    Sketch(PathBuf),
    Capture,
    Submit,
    Exit,
    Confirm,
    Stay,
    Done,
    Coach,
    Chat(String),
    Transcript,
    ClearChat,
    History,
    Stats,
    Login {
        user_id: String,
        display_name: Option<String>,
    },
    Logout,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'; type 'help' for the list")]
    Unknown(String),
    #[error("'{command}' needs {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(word, rest)| (word, rest.trim()))
            .unwrap_or((line, ""));

        let command = match word.to_ascii_lowercase().as_str() {
            "start" | "new" => Self::Start,
            "next" | "n" => Self::Next,
            "back" | "b" => Self::Back,
            // empty notes are allowed and clear what was written
            "notes" => Self::Notes(rest.to_string()),
            "sketch" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument {
                        command: "sketch",
                        what: "an image path",
                    });
                }
                Self::Sketch(PathBuf::from(rest))
            }
            "capture" => Self::Capture,
            "submit" => Self::Submit,
            "exit" => Self::Exit,
            "confirm" | "yes" => Self::Confirm,
            "stay" | "no" => Self::Stay,
            "done" => Self::Done,
            "coach" => Self::Coach,
            "chat" if rest.is_empty() => Self::Transcript,
            "chat" => Self::Chat(rest.to_string()),
            "chat-clear" => Self::ClearChat,
            "history" => Self::History,
            "stats" => Self::Stats,
            "login" => {
                let (user_id, display_name) = rest
                    .split_once(char::is_whitespace)
                    .map(|(user, name)| (user, Some(name.trim().to_string())))
                    .unwrap_or((rest, None));
                if user_id.is_empty() {
                    return Err(CommandError::MissingArgument {
                        command: "login",
                        what: "a user id",
                    });
                }
                Self::Login {
                    user_id: user_id.to_string(),
                    display_name,
                }
            }
            "logout" => Self::Logout,
            "help" | "?" => Self::Help,
            "quit" | "q" => Self::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

pub const HELP: &str = "\
commands:
  start                 begin a session (needs login)
  next | back           move between steps
  notes <text>          record impressions (step 2)
  sketch <path>         attach an image file as the sketch
  capture               pull the configured sketch surface
  submit                send the session for judging (step 4)
  exit | confirm | stay leave the session, with confirmation
  done                  close the feedback screen
  history | stats       show past sessions
  coach                 request a coaching report (3+ sessions)
  chat [question]       ask the coach, or show the conversation
  chat-clear            start the conversation over
  login <id> [name]     sign in
  logout                sign out
  quit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            "notes red, round, warm".parse::<Command>(),
            Ok(Command::Notes("red, round, warm".into()))
        );
        assert_eq!("NEXT".parse::<Command>(), Ok(Command::Next));
        assert_eq!(
            "sketch  ./drawing.png ".parse::<Command>(),
            Ok(Command::Sketch(PathBuf::from("./drawing.png")))
        );
        assert_eq!(
            "login alice Alice Smith".parse::<Command>(),
            Ok(Command::Login {
                user_id: "alice".into(),
                display_name: Some("Alice Smith".into()),
            })
        );
        assert_eq!("notes".parse::<Command>(), Ok(Command::Notes(String::new())));
        assert_eq!(
            "chat why do I miss colors?".parse::<Command>(),
            Ok(Command::Chat("why do I miss colors?".into()))
        );
        assert_eq!("chat  ".parse::<Command>(), Ok(Command::Transcript));
        assert_eq!("chat-clear".parse::<Command>(), Ok(Command::ClearChat));
    }

    #[test]
    fn rejects_unknown_or_incomplete_commands() {
        assert_eq!(
            "dance".parse::<Command>(),
            Err(CommandError::Unknown("dance".into()))
        );
        assert!(matches!(
            "sketch".parse::<Command>(),
            Err(CommandError::MissingArgument {
                command: "sketch",
                ..
            })
        ));
        assert!("login".parse::<Command>().is_err());
    }
}
