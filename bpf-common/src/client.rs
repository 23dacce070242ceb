// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

use std::{
    io::{self, BufRead, BufReader, Write},
    os::unix::io::RawFd,
    os::unix::net::UnixStream,
    path::Path,
};
use passfd::FdPassingExt;
use super::Command;

/// Client side of the privileged loader socket.
///
/// The loader compiles and attaches the submitted program, answers with the
/// fd of its event ring buffer (passed over the socket), and applies map
/// mutations sent as [`Command`] lines.
pub struct LoaderClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl LoaderClient {
    /// Submit a program and receive its ring buffer fd.
    pub fn load<P>(path: P, name: &str, program: &str) -> io::Result<(Self, RawFd)>
    where
        P: AsRef<Path>,
    {
        let mut writer = UnixStream::connect(path)?;
        let reader = BufReader::new(writer.try_clone()?);
        let command = Command::Load {
            name: name.to_string(),
            program_len: program.len(),
        };
        writer.write_fmt(format_args!("{}\n", command))?;
        writer.write_all(program.as_bytes())?;
        let fd = writer.recv_fd()?;
        Ok((LoaderClient { writer, reader }, fd))
    }

    pub fn send_command(&mut self, command: Command) -> io::Result<()> {
        self.writer.write_fmt(format_args!("{}\n", command))
    }

    /// Ask the loader how many events the kernel failed to publish.
    pub fn fetch_lost(&mut self) -> io::Result<u64> {
        self.send_command(Command::FetchLost)?;
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        line.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad counter: {}", e)))
    }
}
