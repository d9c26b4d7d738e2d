//! Simulation hardware for unit testing diagnostic sessions

use std::collections::{HashMap, VecDeque};

use crate::channel::{ChannelError, ChannelResult, KLineChannel};

/// Activity recorded by [SimulationKLineChannel]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// [KLineChannel::wake] was called
    Wake,
    /// A frame was written
    Write(Vec<u8>),
    /// A read was attempted. Holds the frame returned, if any
    Read(Option<Vec<u8>>),
    /// The Rx buffer was cleared
    ClearRx,
}

/// Scripted ECU. Each written frame that has a registered response queues
/// that response for the following reads. Anything else goes unanswered
#[derive(Debug, Clone, Default)]
pub struct SimulationKLineChannel {
    req_resp_map: HashMap<Vec<u8>, Vec<u8>>,
    rx_queue: VecDeque<Vec<u8>>,
    events: Vec<ChannelEvent>,
    fail_writes: bool,
}

impl SimulationKLineChannel {
    /// Creates a simulated ECU that does not respond to anything
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the raw reply frame for a raw request frame
    pub fn add_response(&mut self, req: &[u8], resp: &[u8]) {
        self.req_resp_map.insert(req.to_vec(), resp.to_vec());
    }

    /// Makes every following write fail, as if the adapter was unplugged
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// All recorded channel activity, oldest first
    pub fn events(&self) -> &[ChannelEvent] {
        &self.events
    }

    /// All frames written to the channel, oldest first
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Write(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of read attempts
    pub fn read_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Read(_)))
            .count()
    }
}

impl KLineChannel for SimulationKLineChannel {
    fn wake(&mut self) -> ChannelResult<()> {
        self.events.push(ChannelEvent::Wake);
        Ok(())
    }

    fn write_bytes(&mut self, buffer: &[u8], _timeout_ms: u32) -> ChannelResult<()> {
        if self.fail_writes {
            return Err(ChannelError::APIError {
                api_name: "Simulation".into(),
                code: 1,
                desc: "Write failure".into(),
            });
        }
        self.events.push(ChannelEvent::Write(buffer.to_vec()));
        if let Some(expected_response) = self.req_resp_map.get(buffer) {
            self.rx_queue.push_back(expected_response.clone());
        }
        Ok(())
    }

    fn read_bytes(&mut self, max_bytes: usize, timeout_ms: u32) -> ChannelResult<Option<Vec<u8>>> {
        let res = self.rx_queue.pop_front().map(|mut r| {
            r.truncate(max_bytes);
            r
        });
        if res.is_none() {
            // Behave like real hardware and wait out the timeout
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
        }
        self.events.push(ChannelEvent::Read(res.clone()));
        Ok(res)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.events.push(ChannelEvent::ClearRx);
        self.rx_queue.clear();
        Ok(())
    }
}
