//! Write fan-out: every downstream branch sees every write.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

use crate::Stream;

/// Splits writes across two or more downstream streams. Not readable.
///
/// Errors are aggregated: every branch receives every write regardless of
/// individual failures, and the reported status is the last non-OK error
/// observed. The tee owns its branches and closes all of them.
pub struct TeeStream {
    branches: Vec<Box<dyn Stream>>,
}

impl TeeStream {
    pub fn new(branches: Vec<Box<dyn Stream>>) -> Self {
        Self { branches }
    }

    /// Add another branch; later writes fan out to it too.
    pub fn push(&mut self, branch: Box<dyn Stream>) {
        self.branches.push(branch);
    }
}

impl Stream for TeeStream {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut last_err = None;
        for branch in &mut self.branches {
            if let Err(e) = crate::write_all(branch.as_mut(), buf) {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(buf.len()),
        }
    }

    fn size(&self) -> Result<u64> {
        // The branches may disagree; report the first that answers.
        for branch in &self.branches {
            if let Ok(size) = branch.size() {
                return Ok(size);
            }
        }
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        let mut last_err = None;
        for branch in &mut self.branches {
            if let Err(e) = branch.close() {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A writable stream that appends into a shared byte buffer. Used by tests
/// and by console mirroring of captured child output.
pub struct CollectSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle onto the collected bytes, valid after the sink is gone.
    pub fn buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buffer)
    }
}

impl Default for CollectSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for CollectSink {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.buffer
            .lock()
            .map_err(|_| anyhow!("collect sink poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> Result<u64> {
        Ok(self
            .buffer
            .lock()
            .map_err(|_| anyhow!("collect sink poisoned"))?
            .len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct FailingSink;

    impl Stream for FailingSink {
        fn can_write(&self) -> bool {
            true
        }

        fn write(&mut self, _buf: &[u8]) -> Result<usize> {
            bail!("disk full")
        }

        fn size(&self) -> Result<u64> {
            Ok(0)
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn all_branches_see_every_write() {
        let a = CollectSink::new();
        let b = CollectSink::new();
        let (ha, hb) = (a.buffer(), b.buffer());

        let mut tee = TeeStream::new(vec![Box::new(a), Box::new(b)]);
        crate::write_all(&mut tee, b"first ").expect("write");
        crate::write_all(&mut tee, b"second").expect("write");
        tee.close().expect("close");

        assert_eq!(&*ha.lock().expect("a"), b"first second");
        assert_eq!(&*hb.lock().expect("b"), b"first second");
    }

    #[test]
    fn failing_branch_does_not_starve_siblings() {
        let ok = CollectSink::new();
        let handle = ok.buffer();

        let mut tee = TeeStream::new(vec![Box::new(FailingSink), Box::new(ok)]);
        let err = tee.write(b"payload").expect_err("branch failure surfaces");
        assert!(err.to_string().contains("disk full"));
        // The healthy branch still received the bytes.
        assert_eq!(&*handle.lock().expect("ok"), b"payload");
    }

    #[test]
    fn tee_is_not_readable() {
        let mut tee = TeeStream::new(vec![Box::new(CollectSink::new())]);
        assert!(!tee.can_read());
        assert!(tee.read(&mut [0u8; 4]).is_err());
    }
}
