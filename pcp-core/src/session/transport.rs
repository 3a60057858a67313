use {
    super::errors::{SessionErrorValue, SessionResult},
    crate::atom::{Atom, AtomCodec},
    bytes::{Buf, BytesMut},
    std::time::Duration,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::TcpStream,
        time::timeout,
    },
    tokio_util::codec::{Decoder, Encoder},
};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 16 * 1024;

/// Buffered atom I/O over one connection.
///
/// Every write is bounded by the send timeout so a stalled peer cannot hold the
/// connection open indefinitely.
pub struct AtomStream {
    reader: BoxedReader,
    writer: BoxedWriter,
    read_buf: BytesMut,
    write_buf: BytesMut,
    codec: AtomCodec,
    send_timeout: Duration,
}

impl AtomStream {
    #[must_use]
    pub fn new(reader: BoxedReader, writer: BoxedWriter, send_timeout: Duration) -> Self {
        Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            codec: AtomCodec::default(),
            send_timeout,
        }
    }

    #[must_use]
    pub fn from_tcp(stream: TcpStream, send_timeout: Duration) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(Box::new(reader), Box::new(writer), send_timeout)
    }

    /// Bytes already taken off the socket, to be consumed before anything new.
    #[must_use]
    pub fn with_buffered(mut self, bytes: &[u8]) -> Self {
        self.read_buf.extend_from_slice(bytes);
        self
    }

    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    /// Drop everything read so far, for peers whose input is ignored.
    pub fn discard_buffered(&mut self) {
        self.read_buf.clear();
    }

    /// Read whatever the peer has sent next. Cancel safe.
    pub async fn fill(&mut self) -> SessionResult<usize> {
        self.read_buf.reserve(READ_CHUNK);
        let n = self.reader.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(SessionErrorValue::Closed.into());
        }
        Ok(n)
    }

    /// Next complete atom already buffered, if any.
    pub fn try_read_atom(&mut self) -> SessionResult<Option<Atom>> {
        Ok(self.codec.decode(&mut self.read_buf)?)
    }

    pub async fn read_atom(&mut self) -> SessionResult<Atom> {
        loop {
            if let Some(atom) = self.try_read_atom()? {
                return Ok(atom);
            }
            self.fill().await?;
        }
    }

    pub async fn read_atom_timeout(
        &mut self,
        limit: Duration,
        what: &'static str,
    ) -> SessionResult<Atom> {
        timeout(limit, self.read_atom())
            .await
            .map_err(|_| SessionErrorValue::Timeout(what))?
    }

    /// Read until `parse` recognises a complete header, consuming exactly its bytes.
    pub async fn read_header<T, F>(&mut self, max_len: usize, parse: F) -> SessionResult<T>
    where
        F: Fn(&[u8]) -> SessionResult<Option<(T, usize)>>,
    {
        loop {
            if let Some((header, len)) = parse(&self.read_buf)? {
                self.read_buf.advance(len);
                return Ok(header);
            }
            if self.read_buf.len() >= max_len {
                return Err(SessionErrorValue::HeaderTooLarge(max_len).into());
            }
            self.fill().await?;
        }
    }

    pub async fn write_atom(&mut self, atom: &Atom) -> SessionResult<()> {
        self.codec.encode(atom, &mut self.write_buf)?;
        self.flush_write_buf().await
    }

    /// Encode several atoms and send them with a single write.
    pub async fn write_atoms(&mut self, atoms: &[Atom]) -> SessionResult<()> {
        for atom in atoms {
            self.codec.encode(atom, &mut self.write_buf)?;
        }
        self.flush_write_buf().await
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> SessionResult<()> {
        self.write_buf.extend_from_slice(bytes);
        self.flush_write_buf().await
    }

    async fn flush_write_buf(&mut self) -> SessionResult<()> {
        let send_timeout = self.send_timeout;
        let Self {
            writer, write_buf, ..
        } = self;
        let result = timeout(send_timeout, async move {
            writer.write_all(write_buf).await?;
            writer.flush().await
        })
        .await;
        self.write_buf.clear();
        match result {
            Ok(io_result) => Ok(io_result?),
            Err(_) => Err(SessionErrorValue::Timeout("send").into()),
        }
    }

    /// Flush and close the write side; errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        let _ = timeout(self.send_timeout, self.writer.shutdown()).await;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{atom::define::name, session::http::RelayRequest, utils::Guid},
        tokio::io::{duplex, split},
    };

    fn pair(send_timeout: Duration) -> (AtomStream, AtomStream) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            AtomStream::new(Box::new(ar), Box::new(aw), send_timeout),
            AtomStream::new(Box::new(br), Box::new(bw), send_timeout),
        )
    }

    #[tokio::test]
    async fn test_atoms_cross_the_wire_in_order() {
        let (mut a, mut b) = pair(Duration::from_secs(1));
        a.write_atoms(&[Atom::with_u32(name::OK, 1), Atom::with_u32(name::QUIT, 1003)])
            .await
            .unwrap();
        assert_eq!(b.read_atom().await.unwrap().as_u32().unwrap(), 1);
        assert_eq!(b.read_atom().await.unwrap().as_u32().unwrap(), 1003);
    }

    #[tokio::test]
    async fn test_header_then_atoms() {
        let (mut a, mut b) = pair(Duration::from_secs(1));
        let id = Guid::new();
        let mut bytes = RelayRequest::new(id).to_bytes();
        bytes.extend_from_slice(&Atom::with_u32(name::CONNECT, 1).encode().unwrap());
        a.write_bytes(&bytes).await.unwrap();

        let request = b.read_header(4096, RelayRequest::parse).await.unwrap();
        assert_eq!(request.channel_id, id);
        assert_eq!(b.read_atom().await.unwrap().name(), name::CONNECT);
    }

    #[tokio::test]
    async fn test_header_limit_and_close() {
        let (mut a, mut b) = pair(Duration::from_secs(1));
        a.write_bytes(&[b'x'; 64]).await.unwrap();
        drop(a);
        let err = b
            .read_header(32, |_| Ok(None::<((), usize)>))
            .await
            .unwrap_err();
        assert!(matches!(err.value, SessionErrorValue::HeaderTooLarge(32)));

        let err = b.read_atom().await.unwrap_err();
        assert!(matches!(err.value, SessionErrorValue::AtomError(_) | SessionErrorValue::Closed));
    }

    #[tokio::test]
    async fn test_send_timeout() {
        // nobody drains the other end
        let (_peer, b) = duplex(16);
        let (br, bw) = split(b);
        let mut stream = AtomStream::new(Box::new(br), Box::new(bw), Duration::from_millis(50));
        let big = Atom::with_value(name::CHAN_PKT_DATA, vec![0u8; 1024]);
        let err = stream.write_atom(&big).await.unwrap_err();
        assert!(matches!(err.value, SessionErrorValue::Timeout("send")));
    }
}
