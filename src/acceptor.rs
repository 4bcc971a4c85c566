//! Outer accept loop: binds the vhost-user Unix socket and spawns one
//! thread per accepted connection, each running its own `mio::Poll` reactor
//! over the control stream and the negotiated kick eventfds. A session
//! thread dying (a misbehaving front-end, a malformed message) never takes
//! down the acceptor or any other session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mio::net::{UnixListener, UnixStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use std::os::fd::AsRawFd;

use crate::{
    device::LoopbackDevice,
    error::{AppError, AppResult},
    pcap::PacketSink,
    session::Session,
    stats::Stats,
};

const LISTENER_TOKEN: Token = Token(0);
const STREAM_TOKEN: Token = Token(1);
const KICK_TOKEN_BASE: usize = 2;

/// Upper bound on how long a session's reactor blocks between ticks. Queues
/// set up in poll mode (SET_VRING_KICK with no descriptor) have no fd to wait
/// on, so `service_queues` must also run on a bare timeout, not only when the
/// control stream or a kick fd wakes the poll.
const SERVICE_TICK: Duration = Duration::from_millis(100);

pub struct Acceptor {
    socket_path: PathBuf,
    pcap_path: Option<PathBuf>,
    stats: Stats,
}

impl Acceptor {
    pub fn new<P: AsRef<Path>>(socket_path: P, pcap_path: Option<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            pcap_path,
            stats: Stats::default(),
        }
    }

    /// Binds the listener and accepts connections until a fatal poll error
    /// occurs. Each accepted connection gets its own session thread; a
    /// session thread dying never tears down the acceptor.
    pub fn run(&self) -> AppResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let mut listener = UnixListener::bind(&self.socket_path)?;
        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        tracing::info!(path = ?self.socket_path, "listening for vhost-user connections");
        let mut events = Events::with_capacity(8);

        loop {
            if let Err(error) = poll.poll(&mut events, None) {
                if error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(?error, "acceptor poll failed, shutting down");
                return Err(AppError::Io(error));
            }

            for event in &events {
                if event.token() != LISTENER_TOKEN {
                    continue;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tracing::info!(?peer, "accepted vhost-user connection");
                        self.spawn_session(stream);
                    }
                    Err(error) => {
                        tracing::warn!(?error, "failed to accept vhost-user connection");
                    }
                }
            }
        }
    }

    fn spawn_session(&self, stream: UnixStream) {
        let pcap_path = self.pcap_path.clone();
        let stats = self.stats.clone();
        let result = std::thread::Builder::new()
            .name(String::from("vhost-session"))
            .spawn(move || {
                if let Err(error) = run_session(stream, pcap_path, stats) {
                    tracing::warn!(?error, "session terminated");
                }
            });

        if let Err(error) = result {
            tracing::warn!(?error, "failed to spawn session thread");
        }
    }
}

/// Runs a single session's reactor loop on the calling thread: the control
/// stream and every negotiated kick eventfd are registered with a
/// thread-local `mio::Poll` instance.
fn run_session(stream: UnixStream, pcap_path: Option<PathBuf>, stats: Stats) -> AppResult<()> {
    let sink = match pcap_path {
        Some(path) => Some(PacketSink::create(&path)?),
        None => None,
    };

    let device = LoopbackDevice::new(sink);
    let raw_fd = stream.as_raw_fd();
    let mut session = Session::new(raw_fd, device, stats);

    let mut poll = Poll::new()?;
    let mut stream = stream;
    poll.registry()
        .register(&mut stream, STREAM_TOKEN, Interest::READABLE)?;

    // One slot per queue index, tracking which raw fd (if any) is currently
    // registered under that queue's kick token.
    let mut registered_kicks: [Option<std::os::fd::RawFd>; 2] = [None, None];
    let mut events = Events::with_capacity(8);

    loop {
        poll.poll(&mut events, Some(SERVICE_TICK))?;

        let mut drained_control = false;

        for event in &events {
            if event.token() == STREAM_TOKEN {
                drained_control = true;
            } else if event.token().0 >= KICK_TOKEN_BASE {
                drain_eventfd(event.token().0 - KICK_TOKEN_BASE, &registered_kicks);
            }
        }

        if drained_control {
            loop {
                match session.handle_readable() {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::info!("vhost-user front-end disconnected");
                        return Ok(());
                    }
                    Err(crate::error::MessageError::Errno(Errno::EWOULDBLOCK | Errno::EAGAIN)) => {
                        break;
                    }
                    Err(error) => return Err(AppError::Config(error.to_string())),
                }
            }
        }

        sync_kick_registrations(&mut poll, &mut registered_kicks, &session)?;

        // Runs every tick regardless of what woke the poll (event or plain
        // timeout) so poll-mode queues, which have no kick fd to wait on,
        // still get drained.
        session.service_queues();
    }
}

fn drain_eventfd(index: usize, registered: &[Option<std::os::fd::RawFd>; 2]) {
    if let Some(Some(fd)) = registered.get(index) {
        let mut buf = [0u8; 8];
        // eventfds are level-triggered in semaphore mode here; a failed
        // drain just means service_queues() runs one extra time.
        let _ = nix::unistd::read(*fd, &mut buf);
    }
}

/// Diffs the session's current kick fds against what's registered with
/// `poll`, registering newly-set fds and deregistering cleared ones.
fn sync_kick_registrations(
    poll: &mut Poll,
    registered: &mut [Option<std::os::fd::RawFd>; 2],
    session: &Session,
) -> AppResult<()> {
    for index in 0..registered.len() {
        let current = session.kick_fd(index);
        if current == registered[index] {
            continue;
        }

        if let Some(old) = registered[index].take() {
            let _ = poll.registry().deregister(&mut SourceFd(&old));
        }

        if let Some(new) = current {
            poll.registry().register(
                &mut SourceFd(&new),
                Token(KICK_TOKEN_BASE + index),
                Interest::READABLE,
            )?;
            registered[index] = Some(new);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use std::os::fd::OwnedFd;

    fn pipe_fd() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().unwrap()
    }

    #[test]
    fn sync_kick_registrations_registers_and_deregisters() {
        let mut session = Session::new(-1, LoopbackDevice::new(None), Stats::default());
        let mut poll = Poll::new().unwrap();
        let mut registered: [Option<std::os::fd::RawFd>; 2] = [None, None];

        let (read_end, write_end) = pipe_fd();
        session.set_kick_fd_for_test(0, Some(read_end.as_raw_fd()));

        sync_kick_registrations(&mut poll, &mut registered, &session).unwrap();
        assert_eq!(registered[0], Some(read_end.as_raw_fd()));
        assert_eq!(registered[1], None);

        session.set_kick_fd_for_test(0, None);
        sync_kick_registrations(&mut poll, &mut registered, &session).unwrap();
        assert_eq!(registered[0], None);

        drop(write_end);
    }

    #[test]
    fn drain_eventfd_reads_pending_notification() {
        let (read_end, write_end) = pipe_fd();
        let registered: [Option<std::os::fd::RawFd>; 2] = [Some(read_end.as_raw_fd()), None];

        nix::unistd::write(&write_end, &1u64.to_le_bytes()).unwrap();
        drain_eventfd(0, &registered);
        drop(write_end);

        // the notification was consumed by drain_eventfd; with the writer
        // gone the pipe now reads EOF instead of blocking.
        let mut buf = [0u8; 8];
        assert_eq!(nix::unistd::read(read_end.as_raw_fd(), &mut buf), Ok(0));
    }
}
