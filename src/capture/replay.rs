//! Replay packet source.
//!
//! Reads raw frames back from a file of length-prefixed (u32 big-endian)
//! frame blobs. Deployments that capture from a live device plug their own
//! source into the same seam.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::PacketSource;

/// Maximum replayed frame size; anything larger is a corrupt feed.
const MAX_REPLAY_FRAME: u32 = 64 * 1024;

pub struct ReplaySource {
    reader: BufReader<File>,
}

impl ReplaySource {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }
}

impl PacketSource for ReplaySource {
    fn next_packet(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            // EOF at a frame boundary ends the replay cleanly.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_REPLAY_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("replay frame of {len} bytes exceeds limit"),
            ));
        }

        let mut frame = vec![0u8; len as usize];
        self.reader.read_exact(&mut frame)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::Ipv4Addr;

    use crate::capture::decode::build_ipv4_frame;

    use super::*;

    fn write_feed(path: &Path, frames: &[Vec<u8>]) {
        let mut file = File::create(path).expect("create feed");
        for frame in frames {
            file.write_all(&(frame.len() as u32).to_be_bytes())
                .expect("len");
            file.write_all(frame).expect("frame");
        }
    }

    #[test]
    fn test_replays_frames_then_ends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.bin");
        let a = build_ipv4_frame(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 64);
        let b = build_ipv4_frame(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 32);
        write_feed(&path, &[a.clone(), b.clone()]);

        let mut source = ReplaySource::open(&path).expect("open");
        assert_eq!(source.next_packet().expect("first"), Some(a));
        assert_eq!(source.next_packet().expect("second"), Some(b));
        assert_eq!(source.next_packet().expect("eof"), None);
    }

    #[test]
    fn test_truncated_feed_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.bin");
        let mut file = File::create(&path).expect("create feed");
        file.write_all(&100u32.to_be_bytes()).expect("len");
        file.write_all(&[0u8; 10]).expect("partial");
        drop(file);

        let mut source = ReplaySource::open(&path).expect("open");
        assert!(source.next_packet().is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.bin");
        let mut file = File::create(&path).expect("create feed");
        file.write_all(&(MAX_REPLAY_FRAME + 1).to_be_bytes())
            .expect("len");
        drop(file);

        let mut source = ReplaySource::open(&path).expect("open");
        assert!(source.next_packet().is_err());
    }
}
