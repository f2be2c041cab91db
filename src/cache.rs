use crate::{address, mem_fetch::MemFetch};
use std::collections::VecDeque;

#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RequestStatus {
    HIT = 0,
    /// Line is being filled by an earlier miss; poll later.
    HIT_RESERVED,
    /// Sent on its way; poll `access_ready` for the response.
    MISS,
    /// No resources to even accept the request; retry next cycle.
    RESERVATION_FAIL,
}

/// Side effects of an access the caller may need to account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ReadRequestSent,
    WriteRequestSent,
    WriteBackRequestSent,
    WriteAllocateSent,
}

/// Timing contract of one cache instance.
///
/// Replacement, MSHR and miss-queue internals stay behind this trait;
/// the core only distinguishes the four access outcomes and polls for
/// returned responses.
pub trait Cache: Send + Sync + 'static {
    fn cycle(&mut self, cycle: u64);

    fn access(
        &mut self,
        addr: address,
        fetch: MemFetch,
        events: &mut Vec<Event>,
        time: u64,
    ) -> RequestStatus;

    fn fill(&mut self, fetch: MemFetch, time: u64);

    fn access_ready(&self) -> bool;

    fn next_access(&mut self) -> Option<MemFetch>;

    fn data_port_free(&self) -> bool;

    fn fill_port_free(&self) -> bool;

    fn flush(&mut self) {}

    fn invalidate(&mut self) {}

    fn waiting_for_fill(&self, _fetch: &MemFetch) -> bool {
        false
    }
}

/// Ideal cache: every access hits with no latency.
///
/// Stands in for a real hierarchy in unit tests and perfect-memory
/// experiments.
#[derive(Debug, Default)]
pub struct PerfectCache {
    ready: VecDeque<MemFetch>,
}

impl Cache for PerfectCache {
    fn cycle(&mut self, _cycle: u64) {}

    fn access(
        &mut self,
        _addr: address,
        _fetch: MemFetch,
        _events: &mut Vec<Event>,
        _time: u64,
    ) -> RequestStatus {
        RequestStatus::HIT
    }

    fn fill(&mut self, mut fetch: MemFetch, _time: u64) {
        fetch.set_reply();
        self.ready.push_back(fetch);
    }

    fn access_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn next_access(&mut self) -> Option<MemFetch> {
        self.ready.pop_front()
    }

    fn data_port_free(&self) -> bool {
        true
    }

    fn fill_port_free(&self) -> bool {
        true
    }
}
