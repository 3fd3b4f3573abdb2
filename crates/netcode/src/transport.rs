//! TCP glue around the frame codec: a `BufRead` reader and a plain writer
//! over the same socket, so a caller never has to juggle the two itself.

use crate::error::NetworkResult;
use crate::frame::{self, Frame};
use crate::message;
use serde::Serialize;
use std::io::BufReader;
use std::net::TcpStream;

pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    pub fn new(stream: TcpStream) -> NetworkResult<Connection> {
        let writer = stream.try_clone()?;
        Ok(Connection { reader: BufReader::new(stream), writer })
    }

    pub fn read_frame(&mut self) -> NetworkResult<Option<Frame>> {
        frame::read_frame(&mut self.reader)
    }

    pub fn send_control(&mut self, verb: &str, field: &str) -> NetworkResult<()> {
        frame::write_control(&mut self.writer, verb, field)
    }

    pub fn send_payload<T: Serialize>(&mut self, verb: &str, value: &T) -> NetworkResult<()> {
        let bytes = message::encode(value)?;
        frame::write_payload(&mut self.writer, verb, &bytes)
    }
}
