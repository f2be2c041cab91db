use console::style;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Anything travelling the interconnect, stamped with its injection time.
#[derive(Debug, Clone)]
pub struct Packet<T> {
    pub data: T,
    pub time: u64,
}

impl<T: std::fmt::Display> std::fmt::Display for Packet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.data.fmt(f)
    }
}

/// Network between clusters and memory partitions.
///
/// Methods take `&self`: implementations lock internally so cores and
/// partitions can share one instance.
pub trait Interconnect<P>: Send + Sync + 'static {
    fn busy(&self) -> bool;

    /// Inject a packet. The caller must have checked `has_buffer` first.
    fn push(&self, src: usize, dest: usize, packet: P, size: u32);

    /// Eject the next packet destined for `dest`, if any.
    fn pop(&self, dest: usize) -> Option<P>;

    fn has_buffer(&self, dest: usize, size: u32) -> bool;
}

/// Zero-latency interconnect with one unbounded queue per node.
///
/// A stand-in for a real network model; delivery order is FIFO per
/// destination and `has_buffer` never applies backpressure.
#[derive(Debug)]
pub struct ToyInterconnect<P> {
    pub num_clusters: usize,
    pub num_mem_partitions: usize,
    output_queue: Vec<Mutex<VecDeque<P>>>,
}

impl<P> ToyInterconnect<P> {
    #[must_use]
    pub fn new(num_clusters: usize, num_mem_partitions: usize) -> Self {
        let num_nodes = num_clusters + num_mem_partitions;
        let output_queue = (0..num_nodes).map(|_| Mutex::new(VecDeque::new())).collect();
        Self {
            num_clusters,
            num_mem_partitions,
            output_queue,
        }
    }
}

impl<P> Interconnect<P> for ToyInterconnect<P>
where
    P: std::fmt::Display + Send + Sync + 'static,
{
    fn busy(&self) -> bool {
        self.output_queue
            .iter()
            .any(|queue| !queue.lock().unwrap().is_empty())
    }

    fn push(&self, src: usize, dest: usize, packet: P, size: u32) {
        assert!(dest < self.output_queue.len());
        log::debug!(
            "{}: {size} bytes from node {src} to {dest}",
            style(format!("INTERCONN PUSH {packet}")).bold(),
        );
        self.output_queue[dest].lock().unwrap().push_back(packet);
    }

    fn pop(&self, dest: usize) -> Option<P> {
        self.output_queue[dest].lock().unwrap().pop_front()
    }

    fn has_buffer(&self, _dest: usize, _size: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toy_interconnect_is_fifo_per_destination() {
        let interconn: ToyInterconnect<u32> = ToyInterconnect::new(2, 1);
        assert!(!interconn.busy());

        interconn.push(0, 2, 10, 8);
        interconn.push(1, 2, 20, 8);
        interconn.push(0, 1, 30, 8);
        assert!(interconn.busy());

        assert_eq!(interconn.pop(2), Some(10));
        assert_eq!(interconn.pop(2), Some(20));
        assert_eq!(interconn.pop(1), Some(30));
        assert_eq!(interconn.pop(0), None);
        assert!(!interconn.busy());
    }
}
