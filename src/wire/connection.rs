use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;

use crate::wire::codec::{CodecError, Frame, WireCodec};

/// One framed TCP socket. Reads are sequential under the reader lock and
/// every frame is written whole under the single send lock, so any number
/// of threads may call [`TaggedConnection::send`] concurrently.
pub struct TaggedConnection {
    codec: WireCodec,
    peer_addr: SocketAddr,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    control: TcpStream,
}

impl TaggedConnection {
    pub fn from_stream(stream: TcpStream, codec: WireCodec) -> io::Result<Self> {
        // Accepted sockets can inherit the listener's non-blocking flag.
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        let control = stream.try_clone()?;

        Ok(Self {
            codec,
            peer_addr,
            reader: Mutex::new(BufReader::new(stream)),
            writer: Mutex::new(BufWriter::new(writer)),
            control,
        })
    }

    pub fn connect<A: ToSocketAddrs>(address: A, codec: WireCodec) -> io::Result<Self> {
        Self::from_stream(TcpStream::connect(address)?, codec)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn codec(&self) -> &WireCodec {
        &self.codec
    }

    pub fn send(&self, frame: &Frame) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        self.codec.write_frame(&mut *writer, frame)
    }

    pub fn send_parts(
        &self,
        tag: u32,
        request_type: u16,
        payload: Vec<u8>,
    ) -> Result<(), CodecError> {
        self.send(&Frame::new(tag, request_type, payload))
    }

    /// Blocks for the next whole frame. Only one thread should be reading.
    pub fn receive(&self) -> Result<Frame, CodecError> {
        let mut reader = self.reader.lock().expect("connection reader lock poisoned");
        self.codec.read_frame(&mut *reader)
    }

    /// Unblocks a reader parked in [`TaggedConnection::receive`] without
    /// taking its lock.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.control.shutdown(Shutdown::Both) {
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    use crate::wire::codec::{CodecError, Frame, WireCodec};

    use super::TaggedConnection;

    fn connected_pair() -> (TaggedConnection, TaggedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        let client = TaggedConnection::connect(addr, WireCodec::default())
            .expect("client should connect");
        let (stream, _) = listener.accept().expect("server should accept");
        let server =
            TaggedConnection::from_stream(stream, WireCodec::default()).expect("server side");
        (client, server)
    }

    #[test]
    fn concurrent_senders_never_interleave_frames() {
        let (client, server) = connected_pair();
        let client = Arc::new(client);

        let senders: Vec<_> = (0..8_u32)
            .map(|tag| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    client
                        .send_parts(tag, 3, vec![tag as u8; 4096])
                        .expect("frame should send");
                })
            })
            .collect();
        for sender in senders {
            sender.join().expect("sender thread should finish");
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let frame = server.receive().expect("frame should arrive whole");
            assert!(frame.payload.iter().all(|byte| *byte == frame.tag as u8));
            seen.push(frame.tag);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_unblocks_a_parked_reader() {
        let (client, _server) = connected_pair();
        let client = Arc::new(client);
        let reader = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.receive())
        };

        client.shutdown().expect("shutdown should succeed");
        let result = reader.join().expect("reader thread should finish");
        assert!(matches!(
            result,
            Err(CodecError::ConnectionClosed) | Err(CodecError::Io(_))
        ));
    }

    #[test]
    fn reports_peer_address() {
        let (client, server) = connected_pair();
        assert_eq!(client.peer_addr().ip().to_string(), "127.0.0.1");
        server
            .send(&Frame::new(1, 1, vec![1]))
            .expect("server should send");
        assert_eq!(client.receive().expect("frame").payload, vec![1]);
    }
}
