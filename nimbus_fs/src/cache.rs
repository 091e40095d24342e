//! Sparse byte-range cache backing an open file handle.
//!
//! The cache partitions `[0, size)` into sorted, non-overlapping, gap-free
//! regions. A region is either `Empty` (its bytes live in the backend, or
//! are zero) or `Buffered` (its bytes are held here, possibly dirty).
//! Adjacent regions of the same kind are merged after every mutation.

use std::ops::Range;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionState {
    Empty,
    Buffered { data: Vec<u8>, dirty: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub begin: u64,
    pub end: u64,
    pub state: RegionState,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, RegionState::Buffered { dirty: true, .. })
    }

    fn slice(&self, begin: u64, end: u64) -> Region {
        let state = match &self.state {
            RegionState::Empty => RegionState::Empty,
            RegionState::Buffered { data, dirty } => RegionState::Buffered {
                data: data[(begin - self.begin) as usize..(end - self.begin) as usize].to_vec(),
                dirty: *dirty,
            },
        };
        Region { begin, end, state }
    }
}

#[derive(Debug, Default)]
pub struct BufferCache {
    regions: Vec<Region>,
    size: u64,
    /// Bytes of the backend at or past this offset are stale (a shrink or a
    /// past-end write happened since the last sync) and read as zeros.
    valid_len: u64,
}

impl BufferCache {
    pub fn new(size: u64) -> Self {
        let regions = if size > 0 {
            vec![Region {
                begin: 0,
                end: size,
                state: RegionState::Empty,
            }]
        } else {
            Vec::new()
        };
        Self {
            regions,
            size,
            valid_len: size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    pub fn set_valid_len(&mut self, valid_len: u64) {
        self.valid_len = valid_len.min(self.size);
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn buffered_len(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.state != RegionState::Empty)
            .map(Region::len)
            .sum()
    }

    pub fn dirty_count(&self) -> usize {
        self.regions.iter().filter(|r| r.is_dirty()).count()
    }

    fn overlapping(&self, begin: u64, end: u64) -> impl Iterator<Item = &Region> {
        let start = self.regions.partition_point(|r| r.end <= begin);
        self.regions[start..]
            .iter()
            .take_while(move |r| r.begin < end)
    }

    /// Parts of `[begin, end)` not held in memory, one span per run of
    /// consecutive `Empty` regions.
    pub fn missing_spans(&self, begin: u64, end: u64) -> Vec<Range<u64>> {
        let end = end.min(self.size);
        let mut spans: Vec<Range<u64>> = Vec::new();
        for r in self.overlapping(begin, end) {
            if r.state != RegionState::Empty {
                continue;
            }
            let span = r.begin.max(begin)..r.end.min(end);
            match spans.last_mut() {
                Some(last) if last.end == span.start => last.end = span.end,
                _ => spans.push(span),
            }
        }
        spans
    }

    /// Materializes bytes fetched from the backend as clean regions.
    /// Already buffered parts of the range are left untouched.
    pub fn fill(&mut self, begin: u64, data: Vec<u8>) {
        self.apply(begin, &data, false, false);
    }

    /// Writes `data` at `pos`, growing the cache if it ends past `size`.
    /// Any gap between the old end and `pos` stays `Empty`.
    pub fn write(&mut self, pos: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = pos + data.len() as u64;
        if end > self.size {
            self.grow_to(end);
        }
        self.apply(pos, data, true, true);
    }

    pub fn set_size(&mut self, new_size: u64) {
        if new_size < self.size {
            self.regions.retain(|r| r.begin < new_size);
            if let Some(last) = self.regions.last_mut()
                && last.end > new_size
            {
                if let RegionState::Buffered { data, .. } = &mut last.state {
                    data.truncate((new_size - last.begin) as usize);
                }
                last.end = new_size;
            }
            self.size = new_size;
            self.valid_len = self.valid_len.min(new_size);
        } else if new_size > self.size {
            self.grow_to(new_size);
        }
    }

    fn grow_to(&mut self, new_size: u64) {
        self.regions.push(Region {
            begin: self.size,
            end: new_size,
            state: RegionState::Empty,
        });
        self.size = new_size;
        self.normalize();
    }

    /// Copies `[begin, end)` out of the cache. `Empty` parts read as zeros,
    /// so callers fill missing spans first.
    pub fn copy_out(&self, begin: u64, end: u64) -> Vec<u8> {
        let end = end.min(self.size);
        if begin >= end {
            return Vec::new();
        }
        let mut out = vec![0u8; (end - begin) as usize];
        for r in self.overlapping(begin, end) {
            if let RegionState::Buffered { data, .. } = &r.state {
                let s = r.begin.max(begin);
                let e = r.end.min(end);
                out[(s - begin) as usize..(e - begin) as usize]
                    .copy_from_slice(&data[(s - r.begin) as usize..(e - r.begin) as usize]);
            }
        }
        out
    }

    pub fn dirty_regions(&self) -> Vec<(Range<u64>, Vec<u8>)> {
        self.regions
            .iter()
            .filter_map(|r| match &r.state {
                RegionState::Buffered { data, dirty: true } => {
                    Some((r.begin..r.end, data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Marks the region spanning exactly `range` clean. Returns false if no
    /// such dirty region exists.
    pub fn mark_clean(&mut self, range: &Range<u64>) -> bool {
        for r in &mut self.regions {
            if r.begin == range.start && r.end == range.end {
                if let RegionState::Buffered { dirty, .. } = &mut r.state {
                    let was = *dirty;
                    *dirty = false;
                    self.normalize();
                    return was;
                }
            }
        }
        false
    }

    /// Drops every clean buffered region back to `Empty`.
    pub fn release_clean(&mut self) {
        for r in &mut self.regions {
            if matches!(r.state, RegionState::Buffered { dirty: false, .. }) {
                r.state = RegionState::Empty;
            }
        }
        self.normalize();
    }

    fn apply(&mut self, begin: u64, data: &[u8], dirty: bool, overwrite: bool) {
        let end = (begin + data.len() as u64).min(self.size);
        let mut empties: Vec<Range<u64>> = Vec::new();
        for r in self
            .regions
            .iter_mut()
            .filter(|r| r.begin < end && r.end > begin)
        {
            let region_begin = r.begin;
            let s = region_begin.max(begin);
            let e = r.end.min(end);
            match &mut r.state {
                RegionState::Buffered {
                    data: buffered,
                    dirty: region_dirty,
                } => {
                    if overwrite {
                        buffered[(s - region_begin) as usize..(e - region_begin) as usize]
                            .copy_from_slice(&data[(s - begin) as usize..(e - begin) as usize]);
                        *region_dirty |= dirty;
                    }
                }
                RegionState::Empty => empties.push(s..e),
            }
        }
        for span in empties {
            let bytes = data[(span.start - begin) as usize..(span.end - begin) as usize].to_vec();
            self.splice(
                span.start,
                span.end,
                RegionState::Buffered { data: bytes, dirty },
            );
        }
        self.normalize();
    }

    /// Replaces `[begin, end)` with one region in `state`, splitting the
    /// regions at both boundaries.
    fn splice(&mut self, begin: u64, end: u64, state: RegionState) {
        let mut state = Some(state);
        let mut out = Vec::with_capacity(self.regions.len() + 2);
        for r in self.regions.drain(..) {
            if r.end <= begin || r.begin >= end {
                out.push(r);
                continue;
            }
            if r.begin < begin {
                out.push(r.slice(r.begin, begin));
            }
            if let Some(state) = state.take() {
                out.push(Region { begin, end, state });
            }
            if r.end > end {
                out.push(r.slice(end, r.end));
            }
        }
        self.regions = out;
    }

    fn normalize(&mut self) {
        let mut out: Vec<Region> = Vec::with_capacity(self.regions.len());
        for r in self.regions.drain(..) {
            if r.is_empty() {
                continue;
            }
            if let Some(last) = out.last_mut() {
                match (&mut last.state, &r.state) {
                    (RegionState::Empty, RegionState::Empty) => {
                        last.end = r.end;
                        continue;
                    }
                    (
                        RegionState::Buffered { data: a, dirty: da },
                        RegionState::Buffered { data: b, dirty: db },
                    ) if *da == *db => {
                        a.extend_from_slice(b);
                        last.end = r.end;
                        continue;
                    }
                    _ => {}
                }
            }
            out.push(r);
        }
        self.regions = out;
    }

    /// Verifies the partition invariants; used by tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut expected = 0;
        for (i, r) in self.regions.iter().enumerate() {
            if r.begin != expected {
                return Err(format!("region {i} starts at {} not {expected}", r.begin));
            }
            if r.end <= r.begin {
                return Err(format!("region {i} is empty or inverted"));
            }
            if let RegionState::Buffered { data, .. } = &r.state
                && data.len() as u64 != r.len()
            {
                return Err(format!(
                    "region {i} holds {} bytes for a span of {}",
                    data.len(),
                    r.len()
                ));
            }
            expected = r.end;
        }
        if expected != self.size {
            return Err(format!("regions cover {expected} bytes of {}", self.size));
        }
        if self.valid_len > self.size {
            return Err("valid length exceeds size".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn kinds(cache: &BufferCache) -> Vec<(u64, u64, &'static str)> {
        cache
            .regions()
            .iter()
            .map(|r| {
                let kind = match r.state {
                    RegionState::Empty => "empty",
                    RegionState::Buffered { dirty: true, .. } => "dirty",
                    RegionState::Buffered { dirty: false, .. } => "clean",
                };
                (r.begin, r.end, kind)
            })
            .collect()
    }

    #[test]
    fn write_into_middle_splits_in_three() {
        let mut c = BufferCache::new(100);
        c.write(40, &[7; 10]);
        assert_eq!(
            kinds(&c),
            vec![(0, 40, "empty"), (40, 50, "dirty"), (50, 100, "empty")]
        );
        c.check_invariants().unwrap();
    }

    #[test]
    fn write_at_start_splits_in_two() {
        let mut c = BufferCache::new(100);
        c.write(0, &[1; 30]);
        assert_eq!(kinds(&c), vec![(0, 30, "dirty"), (30, 100, "empty")]);
    }

    #[test]
    fn adjacent_dirty_writes_merge() {
        let mut c = BufferCache::new(100);
        c.write(10, &[1; 10]);
        c.write(20, &[2; 10]);
        assert_eq!(
            kinds(&c),
            vec![(0, 10, "empty"), (10, 30, "dirty"), (30, 100, "empty")]
        );
        assert_eq!(c.copy_out(15, 25), vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn fill_keeps_dirty_bytes() {
        let mut c = BufferCache::new(20);
        c.write(5, b"XY");
        let spans = c.missing_spans(0, 20);
        assert_eq!(spans, vec![0..5, 7..20]);
        for span in spans {
            c.fill(span.start, vec![b'.'; (span.end - span.start) as usize]);
        }
        assert_eq!(c.copy_out(0, 10), b".....XY...");
        assert_eq!(c.dirty_count(), 1);
        c.check_invariants().unwrap();
    }

    #[test]
    fn write_past_end_leaves_gap() {
        let mut c = BufferCache::new(10);
        c.write(20, b"abc");
        assert_eq!(c.size(), 23);
        assert_eq!(c.valid_len(), 10);
        assert_eq!(kinds(&c), vec![(0, 20, "empty"), (20, 23, "dirty")]);
        assert_eq!(c.missing_spans(0, 23), vec![0..20]);
    }

    #[test]
    fn shrink_truncates_and_lowers_valid_len() {
        let mut c = BufferCache::new(50);
        c.write(30, &[9; 20]);
        c.set_size(35);
        assert_eq!(kinds(&c), vec![(0, 30, "empty"), (30, 35, "dirty")]);
        assert_eq!(c.valid_len(), 35);
        c.set_size(10);
        assert_eq!(kinds(&c), vec![(0, 10, "empty")]);
        assert_eq!(c.valid_len(), 10);
        c.set_size(40);
        assert_eq!(c.valid_len(), 10);
        c.check_invariants().unwrap();
    }

    #[test]
    fn mark_clean_and_release() {
        let mut c = BufferCache::new(30);
        c.write(0, &[1; 10]);
        c.write(20, &[2; 10]);
        let dirty = c.dirty_regions();
        assert_eq!(dirty.len(), 2);
        assert!(c.mark_clean(&dirty[0].0));
        assert!(!c.mark_clean(&dirty[0].0));
        assert_eq!(c.buffered_len(), 20);
        c.release_clean();
        assert_eq!(kinds(&c), vec![(0, 20, "empty"), (20, 30, "dirty")]);
        assert_eq!(c.buffered_len(), 10);
    }

    #[test]
    fn empty_cache_has_no_regions() {
        let mut c = BufferCache::new(0);
        assert!(c.regions().is_empty());
        assert!(c.missing_spans(0, 10).is_empty());
        c.write(0, b"");
        c.check_invariants().unwrap();
    }

    /// Random operations against a plain byte vector model.
    #[test]
    fn matches_flat_model_under_random_operations() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let backend: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let mut model = backend.clone();
        let mut c = BufferCache::new(backend.len() as u64);

        for step in 0..500 {
            match rng.random_range(0..4) {
                0 => {
                    let pos = rng.random_range(0..=c.size() + 20);
                    let len = rng.random_range(1..40usize);
                    let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                    c.write(pos, &data);
                    let end = pos as usize + len;
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[pos as usize..end].copy_from_slice(&data);
                }
                1 => {
                    let new_size = rng.random_range(0..300u64);
                    c.set_size(new_size);
                    model.resize(new_size as usize, 0);
                }
                2 => {
                    let begin = rng.random_range(0..=c.size());
                    let end = rng.random_range(begin..=c.size());
                    for span in c.missing_spans(begin, end) {
                        let valid = c.valid_len();
                        let mut bytes: Vec<u8> = if span.start < valid {
                            backend[span.start as usize..span.end.min(valid) as usize].to_vec()
                        } else {
                            Vec::new()
                        };
                        bytes.resize((span.end - span.start) as usize, 0);
                        c.fill(span.start, bytes);
                    }
                    assert_eq!(
                        c.copy_out(begin, end),
                        model[begin as usize..end as usize],
                        "step {step}"
                    );
                }
                _ => {
                    // Flushing is modelled elsewhere; here only the shape
                    // is exercised.
                    c.release_clean();
                }
            }
            c.check_invariants()
                .unwrap_or_else(|e| panic!("step {step}: {e}"));
            assert_eq!(c.size(), model.len() as u64);
        }
    }
}
