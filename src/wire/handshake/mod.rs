use std::fmt;
use std::io::{Read, Write};

use crate::wire::codec::{CodecError, Frame, WireCodec};
use crate::wire::request::RequestType;

/// The admission frame reuses the Confirmation code as its tag.
pub const HANDSHAKE_TAG: u32 = 99;

const ACCEPTED: u8 = 1;
const REJECTED: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected,
}

#[derive(Debug)]
pub enum HandshakeError {
    Codec(CodecError),
    UnexpectedFrame { tag: u32, request_type: u16 },
    MalformedPayload { length: usize },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "handshake codec error: {source}"),
            Self::UnexpectedFrame { tag, request_type } => write!(
                f,
                "expected confirmation frame, got tag {tag} with request type {request_type}"
            ),
            Self::MalformedPayload { length } => write!(
                f,
                "confirmation payload must be exactly one byte, got {length}"
            ),
        }
    }
}

impl std::error::Error for HandshakeError {}

pub fn build_admission_frame(admission: Admission) -> Frame {
    let flag = match admission {
        Admission::Accepted => ACCEPTED,
        Admission::Rejected => REJECTED,
    };
    Frame::new(
        HANDSHAKE_TAG,
        RequestType::Confirmation.code(),
        vec![flag],
    )
}

pub fn evaluate_admission_frame(frame: &Frame) -> Result<Admission, HandshakeError> {
    if frame.request_type != RequestType::Confirmation.code() {
        return Err(HandshakeError::UnexpectedFrame {
            tag: frame.tag,
            request_type: frame.request_type,
        });
    }

    match frame.payload.as_slice() {
        [ACCEPTED] => Ok(Admission::Accepted),
        [_] => Ok(Admission::Rejected),
        other => Err(HandshakeError::MalformedPayload {
            length: other.len(),
        }),
    }
}

/// Server side: the first frame written on every accepted socket.
pub fn send_admission<W: Write>(
    codec: &WireCodec,
    writer: &mut W,
    admission: Admission,
) -> Result<(), HandshakeError> {
    codec
        .write_frame(writer, &build_admission_frame(admission))
        .map_err(HandshakeError::Codec)
}

/// Client side: blocks for the server's verdict before any request is sent.
pub fn read_admission<R: Read>(
    codec: &WireCodec,
    reader: &mut R,
) -> Result<Admission, HandshakeError> {
    let frame = codec.read_frame(reader).map_err(HandshakeError::Codec)?;
    evaluate_admission_frame(&frame)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::wire::codec::{Frame, WireCodec};
    use crate::wire::request::RequestType;

    use super::{
        build_admission_frame, evaluate_admission_frame, read_admission, send_admission,
        Admission, HandshakeError, HANDSHAKE_TAG,
    };

    #[test]
    fn admission_frames_carry_a_single_flag_byte() {
        let accepted = build_admission_frame(Admission::Accepted);
        assert_eq!(accepted.tag, HANDSHAKE_TAG);
        assert_eq!(accepted.request_type, RequestType::Confirmation.code());
        assert_eq!(accepted.payload, vec![1]);

        let rejected = build_admission_frame(Admission::Rejected);
        assert_eq!(rejected.payload, vec![0]);
    }

    #[test]
    fn client_reads_what_server_sent() {
        let codec = WireCodec::default();
        let mut stream = Vec::new();
        send_admission(&codec, &mut stream, Admission::Rejected).expect("rejection should write");

        let admission =
            read_admission(&codec, &mut Cursor::new(stream)).expect("rejection should read");
        assert_eq!(admission, Admission::Rejected);
    }

    #[test]
    fn non_confirmation_frame_is_refused() {
        let error = evaluate_admission_frame(&Frame::new(1, RequestType::Login.code(), vec![1]))
            .expect_err("login frame is not a handshake");
        assert!(matches!(
            error,
            HandshakeError::UnexpectedFrame {
                tag: 1,
                request_type: 0
            }
        ));

        let error = evaluate_admission_frame(&Frame::new(
            HANDSHAKE_TAG,
            RequestType::Confirmation.code(),
            Vec::new(),
        ))
        .expect_err("empty confirmation is malformed");
        assert!(matches!(error, HandshakeError::MalformedPayload { length: 0 }));
    }
}
