//! key 哈希空间与区间归属
//!
//! key-shared 订阅把 key 的哈希空间 `[0, HASH_RANGE_SIZE)` 切分给多个消费者，
//! 每个消费者只负责落在自身区间内的 key。
//!
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// 哈希空间大小
pub const HASH_RANGE_SIZE: u32 = 65_536;

/// 计算 key 在哈希空间中的位置
pub fn key_hash(key: &str) -> u32 {
    (xxh3_64(key.as_bytes()) % u64::from(HASH_RANGE_SIZE)) as u32
}

/// 半开区间 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyHashRange {
    start: u32,
    end: u32,
}

impl KeyHashRange {
    /// 创建区间，边界被裁剪到哈希空间内，且保证 `start <= end`
    pub fn new(start: u32, end: u32) -> Self {
        let end = end.min(HASH_RANGE_SIZE);
        let start = start.min(end);
        Self { start, end }
    }

    /// 整个哈希空间
    pub fn full() -> Self {
        Self::new(0, HASH_RANGE_SIZE)
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.start <= hash && hash < self.end
    }

    /// 将整个哈希空间均分为 `parts` 段连续区间（最后一段吸收余数）
    pub fn split_evenly(parts: usize) -> Vec<KeyHashRange> {
        if parts == 0 {
            return Vec::new();
        }

        let parts = parts.min(HASH_RANGE_SIZE as usize) as u32;
        let step = HASH_RANGE_SIZE / parts;

        (0..parts)
            .map(|i| {
                let start = i * step;
                let end = if i + 1 == parts {
                    HASH_RANGE_SIZE
                } else {
                    start + step
                };
                KeyHashRange::new(start, end)
            })
            .collect()
    }
}

impl fmt::Display for KeyHashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// 某个消费者当前拥有的区间集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHashRanges {
    ranges: Vec<KeyHashRange>,
}

impl KeyHashRanges {
    pub fn new(ranges: impl IntoIterator<Item = KeyHashRange>) -> Self {
        let mut ranges: Vec<KeyHashRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort();
        ranges.dedup();
        Self { ranges }
    }

    /// 拥有整个哈希空间（单消费者或独占订阅）
    pub fn full() -> Self {
        Self::new([KeyHashRange::full()])
    }

    pub fn ranges(&self) -> &[KeyHashRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains_hash(&self, hash: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(hash))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.contains_hash(key_hash(key))
    }
}

impl FromIterator<KeyHashRange> for KeyHashRanges {
    fn from_iter<T: IntoIterator<Item = KeyHashRange>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for KeyHashRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
