use std::collections::HashMap;

use crate::record::Record;

/// A record plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Position in the caller's input, used for reporting.
    pub row: usize,
    pub record: Record,
    /// Grouping value captured before the record was projected for a pass.
    pub partition: Option<String>,
    /// Number of linked records this entry carries.
    pub weight: usize,
}

impl BatchEntry {
    pub fn new(row: usize, record: Record) -> Self {
        Self {
            row,
            record,
            partition: None,
            weight: 0,
        }
    }

    pub fn with_partition(mut self, value: impl Into<String>) -> Self {
        self.partition = Some(value.into());
        self
    }

    pub fn with_weight(mut self, weight: usize) -> Self {
        self.weight = weight;
        self
    }

    fn partition_value(&self, key: &str) -> String {
        match &self.partition {
            Some(value) => value.clone(),
            None => self.record.field_text(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub pass: usize,
    /// Shared grouping value of every entry, when grouping is active.
    pub partition: Option<String>,
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> Vec<Record> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }
}

/// Splits `entries` into batches.
///
/// Without a key the batches are contiguous chunks in input order. With a key,
/// every non-empty key value gets exactly one batch, whatever its size, so no
/// two batches ever share a value. Entries with an empty value share no parent
/// and are chunked normally after the keyed groups.
pub fn schedule(
    entries: Vec<BatchEntry>,
    batch_size: usize,
    partition_key: Option<&str>,
    pass: usize,
) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let Some(key) = partition_key else {
        return chunk(entries, batch_size, pass, 0);
    };

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<BatchEntry>> = HashMap::new();
    let mut ungrouped = Vec::new();
    for entry in entries {
        let value = entry.partition_value(key);
        if value.is_empty() {
            ungrouped.push(entry);
            continue;
        }
        if !groups.contains_key(&value) {
            order.push(value.clone());
        }
        groups.entry(value).or_default().push(entry);
    }

    let mut batches = Vec::with_capacity(order.len());
    for value in order {
        let entries = groups.remove(&value).unwrap_or_default();
        batches.push(Batch {
            index: batches.len(),
            pass,
            partition: Some(value),
            entries,
        });
    }
    let offset = batches.len();
    batches.extend(chunk(ungrouped, batch_size, pass, offset));
    batches
}

/// Like [`schedule`] without a key, but also closes a batch before its summed
/// entry weight would pass `max_weight`. An entry heavier than the cap still
/// gets a batch of its own.
pub fn schedule_weighted(
    entries: Vec<BatchEntry>,
    batch_size: usize,
    max_weight: usize,
    pass: usize,
) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<BatchEntry> = Vec::new();
    let mut current_weight = 0usize;

    for entry in entries {
        let over_weight = current_weight + entry.weight > max_weight;
        if !current.is_empty() && (current.len() >= batch_size || over_weight) {
            batches.push(Batch {
                index: batches.len(),
                pass,
                partition: None,
                entries: std::mem::take(&mut current),
            });
            current_weight = 0;
        }
        current_weight += entry.weight;
        current.push(entry);
    }
    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            pass,
            partition: None,
            entries: current,
        });
    }
    batches
}

fn chunk(entries: Vec<BatchEntry>, batch_size: usize, pass: usize, first_index: usize) -> Vec<Batch> {
    let mut batches = Vec::with_capacity(entries.len().div_ceil(batch_size));
    let mut iter = entries.into_iter().peekable();
    while iter.peek().is_some() {
        let entries: Vec<BatchEntry> = iter.by_ref().take(batch_size).collect();
        batches.push(Batch {
            index: first_index + batches.len(),
            pass,
            partition: None,
            entries,
        });
    }
    batches
}
