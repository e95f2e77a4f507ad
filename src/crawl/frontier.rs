use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStrategy {
    #[default]
    BestFirst,
    Bfs,
    Dfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub url: String,
    pub depth: u32,
    pub score: f64,
    /// Insertion order, the final tie-breaker.
    pub seq: u64,
}

#[derive(Debug)]
struct HeapItem(FrontierEntry);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher score first; ties by shallower depth, then
        // earlier insertion.
        self.0
            .score
            .partial_cmp(&other.0.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.0.depth.cmp(&self.0.depth))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Crawl frontier. `best_first` pops by score, `bfs` FIFO, `dfs` LIFO.
pub struct Frontier {
    strategy: CrawlStrategy,
    heap: BinaryHeap<HeapItem>,
    queue: VecDeque<FrontierEntry>,
    next_seq: u64,
}

impl Frontier {
    pub fn new(strategy: CrawlStrategy) -> Self {
        Self {
            strategy,
            heap: BinaryHeap::new(),
            queue: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, url: String, depth: u32, score: f64) {
        let entry = FrontierEntry {
            url,
            depth,
            score,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        match self.strategy {
            CrawlStrategy::BestFirst => self.heap.push(HeapItem(entry)),
            CrawlStrategy::Bfs | CrawlStrategy::Dfs => self.queue.push_back(entry),
        }
    }

    pub fn pop(&mut self) -> Option<FrontierEntry> {
        match self.strategy {
            CrawlStrategy::BestFirst => self.heap.pop().map(|item| item.0),
            CrawlStrategy::Bfs => self.queue.pop_front(),
            CrawlStrategy::Dfs => self.queue.pop_back(),
        }
    }

    pub fn len(&self) -> usize {
        match self.strategy {
            CrawlStrategy::BestFirst => self.heap.len(),
            _ => self.queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in storage order, for checkpointing. Priority is recomputed
    /// from the persisted scores on restore.
    pub fn snapshot(&self) -> Vec<FrontierEntry> {
        match self.strategy {
            CrawlStrategy::BestFirst => self.heap.iter().map(|i| i.0.clone()).collect(),
            _ => self.queue.iter().cloned().collect(),
        }
    }

    pub fn restore(strategy: CrawlStrategy, entries: Vec<FrontierEntry>) -> Self {
        let mut frontier = Self::new(strategy);
        frontier.next_seq = entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        for entry in entries {
            match strategy {
                CrawlStrategy::BestFirst => frontier.heap.push(HeapItem(entry)),
                _ => frontier.queue.push_back(entry),
            }
        }
        frontier
    }
}
