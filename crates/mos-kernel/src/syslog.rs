//! System Event Log (SysLog)
//!
//! Records every syscall (request + response) the machine dispatches, for
//! auditing and for tests that want to see what an environment asked for.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use mos_ipc::EnvId;

/// Monotonic event identifier
pub type EventId = u64;

/// A system event (syscall request or response).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Environment that made the syscall
    pub sender: EnvId,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    /// Event type (request or response)
    pub event_type: SysEventType,
}

/// Type of system event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SysEventType {
    /// Syscall request from an environment
    Request {
        /// Syscall number
        syscall_num: u32,
        /// Syscall arguments (up to 4)
        args: [u32; 4],
    },
    /// Syscall response to an environment
    Response {
        /// ID of the request this responds to
        request_id: EventId,
        /// Syscall result (negative = error)
        result: i64,
    },
}

/// Bounded, append-only system event log.
///
/// Once `capacity` events are held the oldest are dropped; ids keep
/// increasing.
pub struct SysLog {
    events: VecDeque<SysEvent>,
    next_id: EventId,
    capacity: usize,
}

impl SysLog {
    /// Create a new empty SysLog holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Log a syscall request.
    ///
    /// Returns the event ID for correlating with the response.
    pub fn log_request(&mut self, sender: EnvId, syscall_num: u32, args: [u32; 4], timestamp: u64) -> EventId {
        self.push(sender, timestamp, SysEventType::Request { syscall_num, args })
    }

    /// Log a syscall response.
    pub fn log_response(&mut self, sender: EnvId, request_id: EventId, result: i64, timestamp: u64) {
        self.push(sender, timestamp, SysEventType::Response { request_id, result });
    }

    fn push(&mut self, sender: EnvId, timestamp: u64, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        if self.capacity == 0 {
            return id;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(SysEvent {
            id,
            sender,
            timestamp,
            event_type,
        });
        id
    }

    /// Get the most recent N events, newest first.
    pub fn get_recent(&self, count: usize) -> Vec<SysEvent> {
        self.events.iter().rev().take(count).cloned().collect()
    }

    /// Requests made by one environment, oldest first, as syscall numbers.
    pub fn requests_of(&self, sender: EnvId) -> Vec<u32> {
        self.events
            .iter()
            .filter(|e| e.sender == sender)
            .filter_map(|e| match e.event_type {
                SysEventType::Request { syscall_num, .. } => Some(syscall_num),
                SysEventType::Response { .. } => None,
            })
            .collect()
    }

    /// Get the number of events held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the next event ID.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_creation() {
        let log = SysLog::new(16);
        assert!(log.is_empty());
        assert_eq!(log.next_id(), 0);
    }

    #[test]
    fn test_syslog_request_response() {
        let mut log = SysLog::new(16);

        let req_id = log.log_request(0x400, 0x20, [0, 0x1000, 0x600, 0], 1000);
        assert_eq!(req_id, 0);
        log.log_response(0x400, req_id, -4, 1100);

        assert_eq!(log.len(), 2);
        let recent = log.get_recent(2);
        assert!(matches!(
            recent[0].event_type,
            SysEventType::Response {
                request_id: 0,
                result: -4
            }
        ));
        assert!(matches!(
            recent[1].event_type,
            SysEventType::Request {
                syscall_num: 0x20,
                ..
            }
        ));
    }

    #[test]
    fn test_syslog_drops_oldest() {
        let mut log = SysLog::new(3);
        for i in 0..10 {
            log.log_request(0x400, i, [0; 4], i as u64);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.next_id(), 10);
        let recent = log.get_recent(3);
        assert_eq!(recent[0].id, 9);
        assert_eq!(recent[2].id, 7);
    }

    #[test]
    fn test_requests_of_filters_sender() {
        let mut log = SysLog::new(16);
        log.log_request(0x400, 1, [0; 4], 0);
        log.log_request(0x401, 2, [0; 4], 0);
        log.log_request(0x400, 3, [0; 4], 0);
        assert_eq!(log.requests_of(0x400), vec![1, 3]);
    }

    #[test]
    fn test_zero_capacity_keeps_ids() {
        let mut log = SysLog::new(0);
        assert_eq!(log.log_request(1, 1, [0; 4], 0), 0);
        assert_eq!(log.log_request(1, 1, [0; 4], 0), 1);
        assert!(log.is_empty());
    }
}
