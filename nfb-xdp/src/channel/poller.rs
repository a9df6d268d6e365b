//! Named worker thread with a cooperative stop flag.

use core::sync::atomic::{AtomicBool, Ordering};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::error;

/// A polling thread that hands its state back when joined.
///
/// The body receives the stop flag and is expected to check it once per
/// pass. Dropping a `Poller` without [`join`](Self::join) still stops and
/// joins the thread.
pub struct Poller<T> {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Poller<T> {
    pub fn spawn<F>(name: String, body: F) -> io::Result<Self>
    where
        F: FnOnce(&AtomicBool) -> T + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(&flag))?;
        Ok(Self { name, stop, handle: Some(handle) })
    }
}

impl<T> Poller<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raise the stop flag without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the thread and wait for it. `None` when the thread panicked.
    pub fn join(mut self) -> Option<T> {
        self.request_stop();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(state) => Some(state),
            Err(_) => {
                error!("poller {} panicked", self.name);
                None
            }
        }
    }
}

impl<T> Drop for Poller<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.request_stop();
            if handle.join().is_err() {
                error!("poller {} panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn test_join_returns_state() {
        let poller = Poller::spawn("eth0/0".into(), |stop: &AtomicBool| {
            let mut passes = 0u32;
            loop {
                passes += 1;
                if stop.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(Duration::from_micros(50));
            }
            (thread::current().name().map(str::to_owned), passes)
        })
        .unwrap();
        thread::sleep(Duration::from_millis(2));
        let (name, passes) = poller.join().unwrap();
        assert_eq!(name.as_deref(), Some("eth0/0"));
        assert!(passes > 0);
    }

    #[test]
    fn test_drop_joins() {
        let done = Arc::new(AtomicBool::new(false));
        let seen = done.clone();
        let poller = Poller::spawn("eth0/1".into(), move |stop: &AtomicBool| {
            while !stop.load(Ordering::Acquire) {
                thread::yield_now();
            }
            seen.store(true, Ordering::Release);
        })
        .unwrap();
        drop(poller);
        assert!(done.load(Ordering::Acquire));
    }
}
