//! Interactive commands typed while in a room.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Anything else is taken as an estimate label and validated later
    Vote(String),
    Reveal,
    NewRound,
    Spectate,
    Rename(String),
    Help,
    Quit,
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        match head {
            "" => Input::Empty,
            "r" | "reveal" => Input::Reveal,
            "c" | "clear" => Input::NewRound,
            "s" | "spectate" => Input::Spectate,
            "n" | "name" if !rest.is_empty() => Input::Rename(rest.to_string()),
            "h" | "help" | "?" => Input::Help,
            "q" | "quit" | "exit" => Input::Quit,
            _ => Input::Vote(line.to_string()),
        }
    }
}

pub const HELP: &str = "\
commands:
  /, 0, 1, 2, 3, 5, 8, 13   submit an estimate
  r                         reveal or hide estimates
  c                         start a new round
  s                         toggle spectating
  n NAME                    change your name
  q                         leave the room";
