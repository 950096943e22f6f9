//! TCP collaborator.
//!
//! Sockets are non-blocking `socket2` sockets. A call that would block
//! registers the fd one-shot with the scheduler's poller under a
//! `Source::Socket` token and parks the actor; when epoll reports the fd
//! ready the scheduler stores [`IoValue::Ready`] in the actor's I/O slot and
//! makes it runnable, and the call retries the syscall.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::actor::{ActorId, Wait};
use crate::error::{Error, Result};
use crate::io::IoValue;
use crate::poller::Interest;
use crate::scheduler::{Kernel, KernelState, Source};

/// A listening socket.
#[derive(Debug)]
pub struct TcpListener {
    socket: Socket,
}

impl TcpListener {
    /// The bound address; useful after binding port 0.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        sock_addr(&self.socket.local_addr()?)
    }
}

/// A connected stream. Dropping it closes the connection.
#[derive(Debug)]
pub struct TcpStream {
    socket: Socket,
}

impl TcpStream {
    /// Address of the remote end.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the socket is not connected.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        sock_addr(&self.socket.peer_addr()?)
    }

    /// Address of the local end.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        sock_addr(&self.socket.local_addr()?)
    }

    /// Disable Nagle's algorithm.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the option cannot be set.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Ok(self.socket.set_nodelay(nodelay)?)
    }
}

fn sock_addr(addr: &SockAddr) -> Result<SocketAddr> {
    addr.as_socket()
        .ok_or(Error::InvalidArgument("not an inet socket address"))
}

fn stream_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    Ok(socket)
}

impl KernelState {
    /// Deregister and forget every socket wait of `dead`.
    pub(crate) fn release_sockets(&mut self, dead: ActorId) {
        for token in 0..self.sources.capacity() {
            if let Some(&Source::Socket { actor, fd }) = self.sources.get(token) {
                if actor == dead {
                    self.poller.deregister(fd);
                    self.sources.free(token);
                }
            }
        }
    }

    /// The poller reported the socket behind `token` ready.
    pub(crate) fn socket_ready(&mut self, token: usize) {
        let Some(Source::Socket { actor, fd }) = self.sources.free(token) else {
            return;
        };
        let slot = actor.slot();
        match self.actors.get_mut(slot) {
            Some(cb) if cb.id == actor && matches!(cb.wait, Some(Wait::Io)) => {
                cb.io = Some(Ok(IoValue::Ready));
                trace!(%actor, fd, "socket ready");
                self.wake(slot, None);
            }
            _ => self.poller.deregister(fd),
        }
    }
}

impl Kernel {
    /// Park the calling actor until `fd` is ready for `interest`.
    fn wait_ready(&self, me: ActorId, fd: RawFd, interest: Interest) -> Result<()> {
        let slot = self.current_slot(me)?;
        {
            let mut st = self.state();
            let token = st
                .sources
                .alloc(Source::Socket { actor: me, fd })
                .map_err(|_| Error::ResourceExhausted("event sources"))?;
            if let Err(err) = st.poller.register(fd, token, interest) {
                st.sources.free(token);
                return Err(err.into());
            }
        }
        if let Err(err) = self.block(slot, Wait::Io) {
            self.state().release_sockets(me);
            return Err(err);
        }
        match self.state().actors.get_mut(slot).and_then(|cb| cb.io.take()) {
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(err.into()),
            None => Err(Error::Closed),
        }
    }

    /// Retry `op` until it stops reporting `WouldBlock`.
    fn retry<T>(
        &self,
        me: ActorId,
        fd: RawFd,
        interest: Interest,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<T> {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_ready(me, fd, interest)?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn tcp_listen(&self, me: ActorId, addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
        self.current_slot(me)?;
        let socket = stream_socket(&addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        debug!(actor = %me, %addr, "listening");
        Ok(TcpListener { socket })
    }

    pub(crate) fn tcp_accept(&self, me: ActorId, listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
        self.current_slot(me)?;
        let fd = listener.socket.as_raw_fd();
        let (socket, peer) = self.retry(me, fd, Interest::Readable, || listener.socket.accept())?;
        socket.set_nonblocking(true)?;
        let peer = sock_addr(&peer)?;
        trace!(actor = %me, %peer, "accepted");
        Ok((TcpStream { socket }, peer))
    }

    pub(crate) fn tcp_connect(&self, me: ActorId, addr: SocketAddr) -> Result<TcpStream> {
        self.current_slot(me)?;
        let socket = stream_socket(&addr)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                self.wait_ready(me, socket.as_raw_fd(), Interest::Writable)?;
                if let Some(err) = socket.take_error()? {
                    return Err(err.into());
                }
            }
            Err(err) => return Err(err.into()),
        }
        trace!(actor = %me, %addr, "connected");
        Ok(TcpStream { socket })
    }

    pub(crate) fn tcp_recv(&self, me: ActorId, stream: &TcpStream, buf: &mut [u8]) -> Result<usize> {
        self.current_slot(me)?;
        let fd = stream.socket.as_raw_fd();
        self.retry(me, fd, Interest::Readable, || (&stream.socket).read(buf))
    }

    pub(crate) fn tcp_send(&self, me: ActorId, stream: &TcpStream, data: &[u8]) -> Result<usize> {
        self.current_slot(me)?;
        let fd = stream.socket.as_raw_fd();
        self.retry(me, fd, Interest::Writable, || (&stream.socket).write(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_sockets_are_non_blocking() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = stream_socket(&addr).unwrap();
        assert!(socket.nonblocking().unwrap());
    }

    #[test]
    fn accept_on_idle_listener_would_block() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = stream_socket(&addr).unwrap();
        socket.bind(&addr.into()).unwrap();
        socket.listen(8).unwrap();
        let listener = TcpListener { socket };
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        let err = listener.socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
