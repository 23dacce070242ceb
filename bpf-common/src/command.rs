// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

use core::fmt;
use core::str::FromStr;

/// One line of the loader protocol. Binary key/value payloads travel
/// hex-encoded; the program text of `Load` follows the command line as
/// `program_len` raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Load {
        name: String,
        program_len: usize,
    },
    MapSet {
        map: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    MapDelete {
        map: String,
        key: Vec<u8>,
    },
    FetchLost,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Load { name, program_len } => write!(f, "load {} {}", name, program_len),
            Command::MapSet { map, key, value } => {
                write!(f, "map_set {} {} {}", map, hex::encode(key), hex::encode(value))
            },
            Command::MapDelete { map, key } => {
                write!(f, "map_delete {} {}", map, hex::encode(key))
            },
            Command::FetchLost => write!(f, "fetch_lost"),
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn word<'a>(words: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<&'a str, String> {
            words.next().ok_or_else(|| format!("missing {}", what))
        }

        fn payload<'a>(words: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<Vec<u8>, String> {
            hex::decode(word(words, what)?).map_err(|e| format!("bad {}: {}", what, e))
        }

        let mut words = s.split(' ');
        match words.next() {
            Some("load") => Ok(Command::Load {
                name: word(&mut words, "name")?.to_string(),
                program_len: word(&mut words, "program length")?
                    .parse()
                    .map_err(|e| format!("bad program length: {}", e))?,
            }),
            Some("map_set") => Ok(Command::MapSet {
                map: word(&mut words, "map name")?.to_string(),
                key: payload(&mut words, "key")?,
                value: payload(&mut words, "value")?,
            }),
            Some("map_delete") => Ok(Command::MapDelete {
                map: word(&mut words, "map name")?.to_string(),
                key: payload(&mut words, "key")?,
            }),
            Some("fetch_lost") => Ok(Command::FetchLost),
            _ => Err("unexpected command".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::str::FromStr;
    use super::Command;

    #[test]
    fn command_line_round_trip() {
        let commands = [
            Command::Load {
                name: "tcp_connect".to_string(),
                program_len: 1337,
            },
            Command::MapSet {
                map: "net_filter".to_string(),
                key: vec![0x08, 0, 0, 0, 0x0a, 0, 0, 0],
                value: vec![0; 40],
            },
            Command::MapDelete {
                map: "net_filter".to_string(),
                key: vec![1, 2, 3],
            },
            Command::FetchLost,
        ];
        for command in &commands {
            assert_eq!(Command::from_str(&command.to_string()).as_ref(), Ok(command));
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Command::from_str("map_set net_filter zz").is_err());
        assert!(Command::from_str("unknown").is_err());
    }
}
