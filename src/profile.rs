//! Per-field decode statistics.
//!
//! A [`Profile`] records, across many parses, how often each field actually
//! decodes and how many elements its repeated runs carry. The compiler
//! consults it to pick layouts: rarely decoded fields move to the cold
//! region, repeated fields preallocate their typical length, and string
//! fields that the profile vouches for skip UTF-8 validation.
//!
//! The decode probability is an exponential moving average, updated on
//! every recorded parse of the containing type: a decoded field pulls its
//! mean toward one, an absent field decays it toward zero. Old workload
//! mixes therefore fade instead of anchoring the statistic forever.
//!
//! Recording is safe from any number of threads; reads of the counters are
//! lock-free.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::reflection::{DynamicMessage, Value};

/// EMA step. Roughly a 32-parse horizon: one hit in a hundred parses keeps
/// the mean well under the cold threshold, while a shifted workload takes
/// effect within a few dozen parses.
const EMA_ALPHA: f32 = 1.0 / 32.0;

const RESERVOIR: usize = 32;

struct SiteStats {
    /// EMA of the decode probability, stored as `f32` bits.
    probability: AtomicU32,
    assume_utf8: AtomicBool,
    counts: Mutex<Reservoir>,
}

impl SiteStats {
    fn new(seed: f32) -> Self {
        SiteStats {
            probability: AtomicU32::new(seed.to_bits()),
            assume_utf8: AtomicBool::new(false),
            counts: Mutex::new(Reservoir::new()),
        }
    }

    /// Fold one parse into the mean: `p += alpha * (target - p)`.
    fn observe(&self, decoded: bool) {
        let target = if decoded { 1.0f32 } else { 0.0f32 };
        let mut current = self.probability.load(Ordering::Relaxed);
        loop {
            let p = f32::from_bits(current);
            let next = (p + EMA_ALPHA * (target - p)).to_bits();
            match self.probability.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    fn mean(&self) -> f32 {
        f32::from_bits(self.probability.load(Ordering::Relaxed))
    }
}

struct TypeStats {
    /// Set once `record` has actually seen a message of this type;
    /// distinguishes real data from sites created by configuration.
    recorded: AtomicBool,
    fields: RwLock<HashMap<u32, Arc<SiteStats>>>,
}

impl TypeStats {
    fn new() -> Self {
        TypeStats {
            recorded: AtomicBool::new(false),
            fields: RwLock::new(HashMap::new()),
        }
    }

    /// Site lookup for a decoded field. A fresh site is seeded with the
    /// observation itself; an existing one folds it into the mean.
    fn hit(&self, number: u32) -> Arc<SiteStats> {
        if let Some(site) = self.fields.read().unwrap().get(&number) {
            site.observe(true);
            return site.clone();
        }
        let mut fields = self.fields.write().unwrap();
        match fields.entry(number) {
            Entry::Occupied(e) => {
                let site = e.get().clone();
                site.observe(true);
                site
            }
            Entry::Vacant(e) => e.insert(Arc::new(SiteStats::new(1.0))).clone(),
        }
    }

    fn site(&self, number: u32) -> Arc<SiteStats> {
        if let Some(site) = self.fields.read().unwrap().get(&number) {
            return site.clone();
        }
        self.fields
            .write()
            .unwrap()
            .entry(number)
            .or_insert_with(|| Arc::new(SiteStats::new(1.0)))
            .clone()
    }
}

struct Reservoir {
    samples: [u32; RESERVOIR],
    filled: usize,
    total: u64,
    rng: u64,
}

impl Reservoir {
    fn new() -> Self {
        Reservoir {
            samples: [0; RESERVOIR],
            filled: 0,
            total: 0,
            rng: 0x9E37_79B9,
        }
    }

    fn push(&mut self, count: u32) {
        self.total += 1;
        if self.filled < RESERVOIR {
            self.samples[self.filled] = count;
            self.filled += 1;
            return;
        }
        // xorshift; replacement probability RESERVOIR / total.
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        let slot = self.rng % self.total;
        if (slot as usize) < RESERVOIR {
            self.samples[slot as usize] = count;
        }
    }

    fn median(&self) -> u32 {
        if self.filled == 0 {
            return 0;
        }
        let mut sorted = self.samples[..self.filled].to_vec();
        sorted.sort_unstable();
        sorted[self.filled / 2]
    }
}

/// What the compiler learns about one field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldProfile {
    /// Moving-average fraction of parses of the containing type in which
    /// this field decoded at least once.
    pub decode_probability: f32,
    /// Median element count for repeated fields.
    pub expected_count: u32,
    /// Skip UTF-8 validation for this string field.
    pub assume_utf8: bool,
}

impl FieldProfile {
    pub(crate) fn unrecorded(is_extension: bool) -> Self {
        FieldProfile {
            decode_probability: if is_extension { 0.25 } else { 0.5 },
            expected_count: 0,
            assume_utf8: false,
        }
    }
}

#[derive(Default)]
pub struct Profile {
    types: RwLock<HashMap<String, Arc<TypeStats>>>,
    populated: AtomicBool,
    assume_utf8_all: AtomicBool,
}

impl Profile {
    pub fn new() -> Self {
        Profile::default()
    }

    /// Trust every string field to be valid UTF-8.
    pub fn set_assume_utf8(&self, assume: bool) {
        self.assume_utf8_all.store(assume, Ordering::Relaxed);
    }

    /// Trust one string field site to be valid UTF-8.
    pub fn set_site_assume_utf8(&self, type_name: &str, number: u32) {
        self.type_stats(type_name)
            .site(number)
            .assume_utf8
            .store(true, Ordering::Relaxed);
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Relaxed)
    }

    /// Recursively fold one parsed message into the statistics: every
    /// decoded field pulls its mean up, every known-but-absent field decays.
    pub fn record(&self, message: &DynamicMessage<'_, '_>) {
        self.populated.store(true, Ordering::Relaxed);
        let stats = self.type_stats(message.full_name());
        stats.recorded.store(true, Ordering::Relaxed);

        let present = message.present_fields();
        let mut numbers = Vec::with_capacity(present.len());
        for (number, value) in &present {
            numbers.push(*number);
            let site = stats.hit(*number);
            match value {
                Value::Repeated(list) => {
                    site.counts.lock().unwrap().push(list.len() as u32);
                    for item in list.iter() {
                        if let Value::Message(sub) = item {
                            self.record(&sub);
                        }
                    }
                }
                Value::Map(map) => {
                    site.counts.lock().unwrap().push(map.len() as u32);
                    for (_, v) in map.iter() {
                        if let Value::Message(sub) = v {
                            self.record(&sub);
                        }
                    }
                }
                Value::Message(sub) => self.record(sub),
                _ => {}
            }
        }

        let fields = stats.fields.read().unwrap();
        for (number, site) in fields.iter() {
            if !numbers.contains(number) {
                site.observe(false);
            }
        }
    }

    /// Statistics for one field site. Fields of a type never recorded fall
    /// back to flat priors; fields of a recorded type that never showed up
    /// report probability zero.
    pub fn for_field(&self, type_name: &str, number: u32, is_extension: bool) -> FieldProfile {
        let assume_all = self.assume_utf8_all.load(Ordering::Relaxed);
        let types = self.types.read().unwrap();
        let Some(stats) = types.get(type_name) else {
            let mut p = FieldProfile::unrecorded(is_extension);
            p.assume_utf8 |= assume_all;
            return p;
        };
        let recorded = stats.recorded.load(Ordering::Relaxed);
        let fields = stats.fields.read().unwrap();
        match fields.get(&number) {
            None => {
                let mut p = if recorded {
                    FieldProfile {
                        decode_probability: 0.0,
                        expected_count: 0,
                        assume_utf8: false,
                    }
                } else {
                    FieldProfile::unrecorded(is_extension)
                };
                p.assume_utf8 |= assume_all;
                p
            }
            Some(site) => {
                let decode_probability = if recorded {
                    site.mean()
                } else {
                    FieldProfile::unrecorded(is_extension).decode_probability
                };
                FieldProfile {
                    decode_probability,
                    expected_count: site.counts.lock().unwrap().median(),
                    assume_utf8: assume_all || site.assume_utf8.load(Ordering::Relaxed),
                }
            }
        }
    }

    fn type_stats(&self, type_name: &str) -> Arc<TypeStats> {
        if let Some(stats) = self.types.read().unwrap().get(type_name) {
            return stats.clone();
        }
        let mut types = self.types.write().unwrap();
        types
            .entry(type_name.to_string())
            .or_insert_with(|| Arc::new(TypeStats::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_before_any_recording() {
        let profile = Profile::new();
        let p = profile.for_field("demo.M", 1, false);
        assert_eq!(p.decode_probability, 0.5);
        assert_eq!(p.expected_count, 0);
        let e = profile.for_field("demo.M", 99, true);
        assert_eq!(e.decode_probability, 0.25);
    }

    #[test]
    fn assume_utf8_flags() {
        let profile = Profile::new();
        profile.set_site_assume_utf8("demo.M", 2);
        assert!(profile.for_field("demo.M", 2, false).assume_utf8);
        assert!(!profile.for_field("demo.M", 3, false).assume_utf8);
        // A configured site carries no recorded data, so probabilities stay
        // at the priors.
        assert_eq!(profile.for_field("demo.M", 2, false).decode_probability, 0.5);
        profile.set_assume_utf8(true);
        assert!(profile.for_field("demo.M", 3, false).assume_utf8);
    }

    #[test]
    fn ema_decays_and_recovers() {
        let site = SiteStats::new(1.0);
        for _ in 0..99 {
            site.observe(false);
        }
        // One hit followed by 99 misses sinks below the cold threshold.
        assert!(site.mean() < 0.1);

        for _ in 0..200 {
            site.observe(true);
        }
        // A shifted workload takes over instead of being averaged away by
        // the old samples.
        assert!(site.mean() > 0.9);
    }

    #[test]
    fn steady_hits_stay_at_one() {
        let site = SiteStats::new(1.0);
        for _ in 0..1000 {
            site.observe(true);
        }
        assert_eq!(site.mean(), 1.0);
    }

    #[test]
    fn reservoir_median() {
        let mut r = Reservoir::new();
        for n in [1u32, 2, 100, 2, 3] {
            r.push(n);
        }
        assert_eq!(r.median(), 2);
        for _ in 0..1000 {
            r.push(7);
        }
        assert_eq!(r.median(), 7);
    }
}
