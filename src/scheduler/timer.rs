//! 一次性定时器队列
//!
//! 每种定时器有一个代号（generation），cancel 只递增代号，
//! 旧条目到期时发现代号不符直接丢弃，等于一次空操作。

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// 定时器种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// 待确认降频的复查
    DowngradeRecheck,
    /// 换曲后的连发复查
    TrackBurst,
    /// 切到 48 kHz 后的再确认
    Reconfirm,
    /// 设备不可用后的重试
    DeviceRetry,
    /// 没有候选读数时的重试
    CandidateRetry,
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
    generation: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// 定时器队列（只在决策线程上使用）
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    generations: HashMap<TimerKind, u64>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn generation(&self, kind: TimerKind) -> u64 {
        self.generations.get(&kind).copied().unwrap_or(0)
    }

    fn is_live(&self, entry: &Entry) -> bool {
        entry.generation == self.generation(entry.kind)
    }

    /// 安排一个定时器（同种类可以有多个）
    pub fn schedule(&mut self, kind: TimerKind, deadline: Instant) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq: self.seq,
            kind,
            generation: self.generation(kind),
        }));
    }

    /// 同种类已有未到期的定时器时不再安排，返回是否安排了
    pub fn schedule_once(&mut self, kind: TimerKind, deadline: Instant) -> bool {
        if self.is_pending(kind) {
            return false;
        }
        self.schedule(kind, deadline);
        true
    }

    /// 取消同种类的旧定时器后重新安排
    pub fn reschedule(&mut self, kind: TimerKind, deadline: Instant) {
        self.cancel(kind);
        self.schedule(kind, deadline);
    }

    /// 取消该种类所有未到期的定时器
    pub fn cancel(&mut self, kind: TimerKind) {
        *self.generations.entry(kind).or_insert(0) += 1;
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.heap
            .iter()
            .any(|Reverse(e)| e.kind == kind && self.is_live(e))
    }

    /// 最早的有效到期时间
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                return Some(head.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// 取出所有已到期的有效定时器（按到期顺序）
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                if self.is_live(&entry) {
                    due.push(entry.kind);
                }
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.iter().filter(|Reverse(e)| self.is_live(e)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
