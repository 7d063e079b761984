use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;

use crate::error::ChannelSetupError;
use crate::table::SlotId;

pub const TOKEN_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub slot: SlotId,
    pub generation: u32,
}

impl Token {
    pub fn new(slot: SlotId, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn encode(self) -> [u8; TOKEN_LEN] {
        let mut buf = [0u8; TOKEN_LEN];
        buf[..4].copy_from_slice(&self.slot.to_le_bytes());
        buf[4..].copy_from_slice(&self.generation.to_le_bytes());
        buf
    }

    pub fn decode(frame: [u8; TOKEN_LEN]) -> Self {
        let [s0, s1, s2, s3, g0, g1, g2, g3] = frame;
        Self {
            slot: u32::from_le_bytes([s0, s1, s2, s3]),
            generation: u32::from_le_bytes([g0, g1, g2, g3]),
        }
    }
}

#[derive(Debug)]
struct FrameReader {
    file: File,
    pending: Vec<u8>,
}

impl FrameReader {
    fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            pending: Vec::with_capacity(TOKEN_LEN * 4),
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn read_once(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; 512];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    fn take_frames(&mut self) -> Vec<Token> {
        let whole = self.pending.len() / TOKEN_LEN * TOKEN_LEN;
        let tokens = self.pending[..whole]
            .chunks_exact(TOKEN_LEN)
            .map(|chunk| {
                let mut frame = [0u8; TOKEN_LEN];
                frame.copy_from_slice(chunk);
                Token::decode(frame)
            })
            .collect();
        self.pending.drain(..whole);
        tokens
    }
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    PollTimeout::from(ms)
}

#[derive(Debug)]
pub struct StartReceiver {
    reader: FrameReader,
}

impl StartReceiver {
    pub fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        let started = std::time::Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if self.reader.wait_readable(remaining)? {
                self.reader.read_once()?;
                return Ok(self.reader.take_frames());
            }
            if remaining.is_zero() || started.elapsed() >= timeout {
                return Ok(Vec::new());
            }
        }
    }
}

#[derive(Debug)]
pub struct CompletionReceiver {
    reader: FrameReader,
}

impl CompletionReceiver {
    pub fn drain(&mut self) -> io::Result<Vec<Token>> {
        while self.reader.read_once()? {}
        Ok(self.reader.take_frames())
    }

    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        self.reader.wait_readable(timeout)
    }
}

#[derive(Debug)]
pub struct HandshakeChannels {
    pub start: StartReceiver,
    pub completion: CompletionReceiver,
    start_tx: OwnedFd,
    done_tx: OwnedFd,
}

impl HandshakeChannels {
    pub fn open() -> Result<Self, ChannelSetupError> {
        let (start_rx, start_tx) = pipe2(OFlag::O_CLOEXEC).map_err(|source| ChannelSetupError {
            what: "start pipe",
            source,
        })?;
        let (done_rx, done_tx) = pipe2(OFlag::O_CLOEXEC).map_err(|source| ChannelSetupError {
            what: "completion pipe",
            source,
        })?;
        fcntl(done_rx.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|source| {
            ChannelSetupError {
                what: "completion pipe O_NONBLOCK",
                source,
            }
        })?;
        Ok(Self {
            start: StartReceiver {
                reader: FrameReader::new(start_rx),
            },
            completion: CompletionReceiver {
                reader: FrameReader::new(done_rx),
            },
            start_tx,
            done_tx,
        })
    }

    pub fn writer_fds(&self) -> (RawFd, RawFd) {
        (self.start_tx.as_raw_fd(), self.done_tx.as_raw_fd())
    }
}

#[derive(Debug)]
pub struct TokenWriter {
    file: File,
}

impl TokenWriter {
    /// # Safety
    /// `fd` must be an open descriptor owned by nobody else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        set_cloexec(fd, true)?;
        Ok(Self {
            file: File::from_raw_fd(fd),
        })
    }

    pub fn send(&mut self, token: Token) -> io::Result<()> {
        self.file.write_all(&token.encode())
    }
}

pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = if on {
        FdFlag::FD_CLOEXEC
    } else {
        FdFlag::empty()
    };
    fcntl(fd, FcntlArg::F_SETFD(flags))
        .map(drop)
        .map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_for(fd: RawFd) -> File {
        let dup = nix::unistd::dup(fd).expect("dup");
        unsafe { File::from_raw_fd(dup) }
    }

    #[test]
    fn token_frame_layout_is_slot_then_generation() {
        let frame = Token::new(3, 0x0102_0304).encode();
        assert_eq!(frame, [3, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(Token::decode(frame), Token::new(3, 0x0102_0304));
    }

    #[test]
    fn completion_drain_is_empty_without_blocking() {
        let mut channels = HandshakeChannels::open().expect("channels");
        let started = std::time::Instant::now();
        assert!(channels.completion.drain().expect("drain").is_empty());
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn completion_drain_reassembles_partial_frames() {
        let mut channels = HandshakeChannels::open().expect("channels");
        let (_, done_fd) = channels.writer_fds();
        let mut tx = writer_for(done_fd);

        let first = Token::new(1, 7).encode();
        let second = Token::new(2, 9).encode();
        tx.write_all(&first).expect("write");
        tx.write_all(&second[..3]).expect("write");
        assert_eq!(
            channels.completion.drain().expect("drain"),
            vec![Token::new(1, 7)]
        );

        tx.write_all(&second[3..]).expect("write");
        assert_eq!(
            channels.completion.drain().expect("drain"),
            vec![Token::new(2, 9)]
        );
    }

    #[test]
    fn start_receive_times_out_when_nothing_is_sent() {
        let mut channels = HandshakeChannels::open().expect("channels");
        let started = std::time::Instant::now();
        let tokens = channels
            .start
            .recv_timeout(Duration::from_millis(50))
            .expect("recv");
        assert!(tokens.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn start_receive_returns_sent_ack() {
        let mut channels = HandshakeChannels::open().expect("channels");
        let (start_fd, _) = channels.writer_fds();
        let mut tx = writer_for(start_fd);
        tx.write_all(&Token::new(4, 1).encode()).expect("write");
        let tokens = channels
            .start
            .recv_timeout(Duration::from_secs(1))
            .expect("recv");
        assert_eq!(tokens, vec![Token::new(4, 1)]);
    }

    #[test]
    fn completion_wait_wakes_on_notice() {
        let channels = HandshakeChannels::open().expect("channels");
        assert!(!channels
            .completion
            .wait(Duration::from_millis(10))
            .expect("wait"));
        let (_, done_fd) = channels.writer_fds();
        writer_for(done_fd)
            .write_all(&Token::new(0, 0).encode())
            .expect("write");
        assert!(channels.completion.wait(Duration::from_secs(1)).expect("wait"));
    }
}
