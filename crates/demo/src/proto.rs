//! Wire schema for the demo chat/movement protocol.
//!
//! Reliable fragments and unreliable tails both carry a run of commands,
//! each an opcode byte followed by its fields.

use netchan::{MessageBuffer, MsgError, CONNECTIONLESS_MARKER};
use thiserror::Error;

const OP_SAY: u8 = 1;
const OP_MOVE: u8 = 2;
const OP_QUIT: u8 = 3;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown opcode {0}")]
    UnknownOp(u8),
    #[error(transparent)]
    Msg(#[from] MsgError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say { name: String, text: String },
    Move { pos: [f32; 3], yaw: f32 },
    Quit,
}

impl Command {
    pub fn encode(&self, msg: &mut MessageBuffer) {
        match self {
            Command::Say { name, text } => {
                msg.write_byte(OP_SAY);
                msg.write_string(name);
                msg.write_string(text);
            }
            Command::Move { pos, yaw } => {
                msg.write_byte(OP_MOVE);
                for &axis in pos {
                    msg.write_coord(axis);
                }
                msg.write_angle16(*yaw);
            }
            Command::Quit => msg.write_byte(OP_QUIT),
        }
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, ProtoError> {
        let op = msg.read_byte()?;
        match op {
            OP_SAY => Ok(Command::Say {
                name: msg.read_string()?,
                text: msg.read_string()?,
            }),
            OP_MOVE => {
                let pos = [msg.read_coord()?, msg.read_coord()?, msg.read_coord()?];
                let yaw = msg.read_angle16()?;
                Ok(Command::Move { pos, yaw })
            }
            OP_QUIT => Ok(Command::Quit),
            other => Err(ProtoError::UnknownOp(other)),
        }
    }
}

pub fn encode_commands(commands: &[Command], max_size: usize) -> Vec<u8> {
    let mut msg = MessageBuffer::new(max_size);
    for command in commands {
        command.encode(&mut msg);
    }
    msg.as_slice().to_vec()
}

pub fn decode_commands(data: &[u8]) -> Result<Vec<Command>, ProtoError> {
    let mut msg = MessageBuffer::from_bytes(data);
    let mut commands = Vec::new();
    while msg.remaining() > 0 {
        commands.push(Command::decode(&mut msg)?);
    }
    Ok(commands)
}

/// Out-of-band handshake datagram: the connectionless marker followed by a
/// command line, e.g. `connect <qport> <name>` or `accept`.
pub fn oob_packet(line: &str) -> Vec<u8> {
    let mut msg = MessageBuffer::new(netchan::MAX_PACKET_SIZE);
    msg.write_long(CONNECTIONLESS_MARKER);
    msg.write_string(line);
    msg.as_slice().to_vec()
}

pub fn oob_line(data: &[u8]) -> Option<String> {
    let mut msg = MessageBuffer::from_bytes(data);
    if msg.read_long().ok()? != CONNECTIONLESS_MARKER {
        return None;
    }
    msg.read_string().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_stream_round_trip() {
        let commands = vec![
            Command::Say {
                name: "alice".into(),
                text: "hello".into(),
            },
            Command::Move {
                pos: [1.0, -2.5, 8.125],
                yaw: 90.0,
            },
            Command::Quit,
        ];
        let data = encode_commands(&commands, netchan::MAX_PACKET_SIZE);
        let decoded = decode_commands(&data).unwrap();
        assert_eq!(decoded, commands);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(matches!(
            decode_commands(&[0xAB]),
            Err(ProtoError::UnknownOp(0xAB))
        ));
    }

    #[test]
    fn test_oob_round_trip() {
        let data = oob_packet("connect 1234 alice");
        assert!(netchan::is_connectionless(&data));
        assert_eq!(oob_line(&data).as_deref(), Some("connect 1234 alice"));

        // sequenced packets are not mistaken for out-of-band ones
        assert_eq!(oob_line(&[0, 0, 0, 0, 1, 2]), None);
    }
}
