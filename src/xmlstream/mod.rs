//! An XML stream: the `<stream:stream>` envelope plus a sequence of
//! top-level child elements, read/written as whole, owned
//! [`minidom::Element`] values.
//!
//! Ported from `tokio-xmpp`'s `xmlstream` module. The teacher's
//! version is generic over a fixed `XmppStreamElement` enum tailored
//! to C2S traffic; this one is generic over any `T: FromXml + AsXml`
//! and is used exclusively with `T = minidom::Element` (see
//! `xso/src/minidom_compat.rs`), since S2S dispatch here is by XML
//! namespace rather than by a closed stanza enum.

mod common;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{ready, Sink, Stream};
use tokio::io::{AsyncBufRead, AsyncWrite};

use xso::{AsXml, FromXml};

pub use common::{StreamHeader, Timeouts};
use common::{RawXmlStream, ReadXsoError, ReadXsoState};

/// Error surfaced from [`XmlStream`]'s `Stream` implementation.
#[derive(Debug)]
pub enum ReadError {
    /// A read timeout elapsed without any data; the caller may choose
    /// to send a keepalive and continue.
    SoftTimeout,
    /// An unrecoverable I/O or XML well-formedness error; the stream
    /// must be torn down.
    HardError(io::Error),
    /// An element was well-formed XML but failed to parse into `T`;
    /// the stream itself is still usable for the next element.
    ParseError(xso::error::Error),
    /// The peer sent `</stream:stream>`.
    StreamFooterReceived,
}

impl From<ReadXsoError> for ReadError {
    fn from(e: ReadXsoError) -> Self {
        match e {
            ReadXsoError::Footer => ReadError::StreamFooterReceived,
            ReadXsoError::Hard(e) => ReadError::HardError(e),
            ReadXsoError::SoftTimeout => ReadError::SoftTimeout,
            ReadXsoError::Parse(e) => ReadError::ParseError(e),
        }
    }
}

pin_project_lite::pin_project! {
    /// A negotiated XML stream, ready to exchange top-level elements.
    pub struct XmlStream<Io, T: FromXml> {
        #[pin]
        raw: RawXmlStream<Io>,
        read_state: ReadXsoState<T>,
        footer_sent: bool,
        footer_seen: bool,
    }
}

impl<Io, T: FromXml> XmlStream<Io, T> {
    fn wrap(raw: RawXmlStream<Io>) -> Self {
        XmlStream {
            raw,
            read_state: ReadXsoState::default(),
            footer_sent: false,
            footer_seen: false,
        }
    }

    /// Whether the peer has sent `</stream:stream>`.
    pub fn footer_seen(&self) -> bool {
        self.footer_seen
    }
}

impl<Io: AsyncBufRead + AsyncWrite, T: FromXml> XmlStream<Io, T> {
    /// Consume the stream, returning the underlying transport.
    pub fn into_inner(self) -> Io {
        self.raw.into_inner()
    }
}

impl<Io: AsyncBufRead + AsyncWrite, T: FromXml> XmlStream<Io, T>
where
    T::Builder: Unpin,
{
    /// Reset parser and writer state in place, for use immediately
    /// after a `<starttls/>` upgrade or dialback stream restart.
    pub fn reset(self: Pin<&mut Self>) {
        let this = self.project();
        this.raw.reset_state();
        *this.read_state = ReadXsoState::default();
        *this.footer_sent = false;
        *this.footer_seen = false;
    }
}

impl<Io: AsyncWrite, T: FromXml> XmlStream<Io, T> {
    /// Send `</stream:stream>`, shutting down only the write half.
    pub async fn send_footer(self: Pin<&mut Self>) -> io::Result<()>
    where
        Io: Unpin,
    {
        use futures::SinkExt;
        let mut this = self.project();
        *this.footer_sent = true;
        this.raw
            .send(xso::Item::ElementFoot)
            .await
            .map(|_| ())
    }
}

impl<Io: AsyncBufRead, T: FromXml> Stream for XmlStream<Io, T>
where
    T::Builder: Unpin,
{
    type Item = Result<T, ReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.footer_seen {
            return Poll::Ready(None);
        }
        match ready!(this.read_state.poll_advance(this.raw, cx)) {
            Ok(v) => Poll::Ready(Some(Ok(v))),
            Err(ReadXsoError::Footer) => {
                *this.footer_seen = true;
                Poll::Ready(None)
            }
            Err(e) => {
                *this.footer_seen = true;
                Poll::Ready(Some(Err(e.into())))
            }
        }
    }
}

impl<'x, Io: AsyncWrite, T: FromXml + AsXml> Sink<&'x T> for XmlStream<Io, T> {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        Sink::<xso::Item<'_>>::poll_ready(this.raw, cx)
    }

    fn start_send(self: Pin<&mut Self>, item: &'x T) -> Result<(), Self::Error> {
        let this = self.project();
        this.raw.start_send_xso(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        Sink::<xso::Item<'_>>::poll_flush(this.raw, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        Sink::<xso::Item<'_>>::poll_close(this.raw, cx)
    }
}

/// Send our stream header, then wait for the peer's: the "we connect
/// out" side of negotiation (used for the OUTBOUND half of a
/// `NetSession`).
pub async fn initiate_stream<Io>(
    io: Io,
    stream_ns: &'static str,
    timeouts: Timeouts,
    header: StreamHeader,
) -> io::Result<(StreamHeader, XmlStream<Io, minidom::Element>)>
where
    Io: AsyncBufRead + AsyncWrite + Unpin,
{
    let mut raw = RawXmlStream::new(io, stream_ns, timeouts);
    header.send(Pin::new(&mut raw)).await?;
    let peer_header = StreamHeader::recv(Pin::new(&mut raw)).await?;
    Ok((peer_header, XmlStream::wrap(raw)))
}

/// Wait for the peer's stream header, then send ours: the "we
/// accepted an incoming TCP connection" side of negotiation (used for
/// the INBOUND half of a `NetSession`).
pub async fn accept_stream<Io>(
    io: Io,
    stream_ns: &'static str,
    timeouts: Timeouts,
    respond: impl FnOnce(&StreamHeader) -> StreamHeader,
) -> io::Result<(StreamHeader, XmlStream<Io, minidom::Element>)>
where
    Io: AsyncBufRead + AsyncWrite + Unpin,
{
    let mut raw = RawXmlStream::new(io, stream_ns, timeouts);
    let peer_header = StreamHeader::recv(Pin::new(&mut raw)).await?;
    let our_header = respond(&peer_header);
    our_header.send(Pin::new(&mut raw)).await?;
    Ok((peer_header, XmlStream::wrap(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use minidom::Element;

    #[tokio::test]
    async fn initiator_and_acceptor_exchange_headers_and_elements() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client_io = tokio::io::BufReader::new(client_io);
        let server_io = tokio::io::BufReader::new(server_io);

        let client = tokio::spawn(async move {
            let (peer_header, mut stream) = initiate_stream(
                client_io,
                crate::ns::JABBER_SERVER,
                Timeouts::tight(),
                StreamHeader {
                    from: Some("a.example".into()),
                    to: Some("b.example".into()),
                    id: None,
                },
            )
            .await
            .unwrap();
            assert_eq!(peer_header.from.as_deref(), Some("b.example"));

            let elem: Element = "<db:result xmlns:db='jabber:server:dialback' from='a.example' to='b.example'>KEY</db:result>".parse().unwrap();
            Pin::new(&mut stream).send(&elem).await.unwrap();
            Pin::new(&mut stream).flush().await.unwrap();

            let received = stream.next().await.unwrap().unwrap();
            assert_eq!(received.name(), "result");
        });

        let server = tokio::spawn(async move {
            let (peer_header, mut stream) = accept_stream(
                server_io,
                crate::ns::JABBER_SERVER,
                Timeouts::tight(),
                |peer| StreamHeader {
                    from: peer.to.clone(),
                    to: peer.from.clone(),
                    id: Some("streamid1".into()),
                },
            )
            .await
            .unwrap();
            assert_eq!(peer_header.from.as_deref(), Some("a.example"));

            let received = stream.next().await.unwrap().unwrap();
            assert_eq!(received.name(), "result");

            Pin::new(&mut stream).send(&received).await.unwrap();
            Pin::new(&mut stream).flush().await.unwrap();
        });

        client.await.unwrap();
        server.await.unwrap();
    }
}
