//! Fake TUN device for testing.
//!
//! All packets are queued in memory: injected packets are served by
//! `read_packet`, written packets are captured for inspection. An optional
//! Darwin mode applies the utun 4-byte family framing on both directions
//! so the prefix handling can be exercised on any platform.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cdtun_core::error::{Error, Result};
use cdtun_core::tunnel::frame::{prepend_family_header, strip_family_header};
use cdtun_core::tunnel::TunDevice;

/// In-memory TUN device.
///
/// Clones share the same queues, so a test can hold one handle while the
/// session under test owns another.
#[derive(Debug)]
pub struct FakeTun {
    name: String,
    /// Frames to be served by read_packet, as they would arrive from the
    /// kernel (including the family prefix in Darwin mode).
    incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Frames handed to the kernel by write_packet.
    outgoing: Arc<Mutex<VecDeque<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    reads: Arc<AtomicU64>,
    darwin_framing: bool,
}

impl FakeTun {
    /// Create a fake device with Linux-style raw framing.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            incoming: Arc::new(Mutex::new(VecDeque::new())),
            outgoing: Arc::new(Mutex::new(VecDeque::new())),
            closed: Arc::new(AtomicBool::new(false)),
            reads: Arc::new(AtomicU64::new(0)),
            darwin_framing: false,
        }
    }

    /// Create a fake device that emulates Darwin utun framing.
    pub fn new_darwin(name: &str) -> Self {
        Self {
            darwin_framing: true,
            ..Self::new(name)
        }
    }

    /// Queue a raw kernel frame for reading, exactly as given.
    pub fn inject_frame(&self, frame: Vec<u8>) {
        self.incoming.lock().unwrap().push_back(frame);
    }

    /// Queue an IP packet for reading, applying Darwin framing if enabled.
    pub fn inject_packet(&self, packet: &[u8]) {
        let frame = if self.darwin_framing {
            prepend_family_header(packet)
        } else {
            packet.to_vec()
        };
        self.inject_frame(frame);
    }

    /// Next frame written to the device, as the kernel would see it.
    pub fn take_outgoing_frame(&self) -> Option<Vec<u8>> {
        self.outgoing.lock().unwrap().pop_front()
    }

    /// All frames written so far.
    pub fn take_all_outgoing(&self) -> Vec<Vec<u8>> {
        self.outgoing.lock().unwrap().drain(..).collect()
    }

    /// Count of frames written and not yet taken.
    pub fn outgoing_count(&self) -> usize {
        self.outgoing.lock().unwrap().len()
    }

    /// Number of read_packet calls served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Clone for FakeTun {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            incoming: Arc::clone(&self.incoming),
            outgoing: Arc::clone(&self.outgoing),
            closed: Arc::clone(&self.closed),
            reads: Arc::clone(&self.reads),
            darwin_framing: self.darwin_framing,
        }
    }
}

impl TunDevice for FakeTun {
    fn read_packet(&self, max_len: usize) -> Result<Vec<u8>> {
        if max_len == 0 {
            return Err(Error::invalid_argument("read size must be positive"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        let Some(frame) = self.incoming.lock().unwrap().pop_front() else {
            return Ok(Vec::new());
        };

        let mut packet = if self.darwin_framing {
            strip_family_header(&frame).map(<[u8]>::to_vec).unwrap_or_default()
        } else {
            frame
        };
        packet.truncate(max_len);
        Ok(packet)
    }

    fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        if packet.is_empty() {
            return Ok(0);
        }

        let frame = if self.darwin_framing {
            prepend_family_header(packet)
        } else {
            packet.to_vec()
        };
        let written = frame.len();
        self.outgoing.lock().unwrap().push_back(frame);

        // Report payload bytes, matching the Darwin driver's contract of
        // excluding the family prefix from the count.
        if self.darwin_framing {
            Ok(written - 4)
        } else {
            Ok(written)
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn handle_id(&self) -> i64 {
        if self.is_closed() { -1 } else { 0 }
    }
}
