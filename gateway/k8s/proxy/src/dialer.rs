use futures::future::BoxFuture;
use http::Uri;
use hyper_util::{
    client::legacy::connect::{Connected, Connection, HttpConnector},
    rt::TokioIo,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::{net::TcpStream, time::Duration};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Opens TCP connections that can all be force-closed at once.
///
/// Connections are tracked whether they are in use, idle in a pool, or
/// upgraded. [`Dialer::close_all`] aborts every connection opened so far;
/// connections opened afterwards are unaffected.
#[derive(Clone, Debug)]
pub struct Dialer {
    connector: HttpConnector,
    shared: Arc<Shared>,
}

/// A connection opened by a [`Dialer`].
pub struct Tracked<T> {
    io: T,
    closed: CancellationToken,
    on_close: Pin<Box<WaitForCancellationFutureOwned>>,
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    generation: Mutex<CancellationToken>,
    open: AtomicUsize,
}

// === impl Dialer ===

impl Dialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_nodelay(true);
        connector.set_connect_timeout(connect_timeout);
        Self {
            connector,
            shared: Arc::default(),
        }
    }

    /// Aborts every connection opened so far.
    pub fn close_all(&self) {
        let closed = std::mem::take(&mut *self.shared.generation.lock());
        closed.cancel();
    }

    /// The number of connections that have not been dropped yet.
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::Acquire)
    }
}

impl tower::Service<Uri> for Dialer {
    type Response = Tracked<TokioIo<TcpStream>>;
    type Error = <HttpConnector as tower::Service<Uri>>::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.connector.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connect = self.connector.call(dst);
        let shared = self.shared.clone();
        Box::pin(async move {
            let io = connect.await?;
            Ok(Tracked::new(io, shared))
        })
    }
}

// === impl Tracked ===

impl<T> Tracked<T> {
    fn new(io: T, shared: Arc<Shared>) -> Self {
        let closed = shared.generation.lock().clone();
        shared.open.fetch_add(1, Ordering::AcqRel);
        Self {
            io,
            on_close: Box::pin(closed.clone().cancelled_owned()),
            closed,
            shared,
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if self.closed.is_cancelled() || self.on_close.as_mut().poll(cx).is_ready() {
            return Poll::Ready(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed by dialer",
            ));
        }
        Poll::Pending
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.shared.open.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: hyper::rt::Read + Unpin> hyper::rt::Read for Tracked<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(error) = this.poll_closed(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<T: hyper::rt::Write + Unpin> hyper::rt::Write for Tracked<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(error) = this.poll_closed(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(error) = this.poll_closed(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl<T: Connection> Connection for Tracked<T> {
    fn connected(&self) -> Connected {
        self.io.connected()
    }
}
