//! Per-key aggregation state.

/// Conversion of an aggregation result into the `i64` written to output
/// records.
pub trait ResultToI64 {
    /// Converts the result to an i64 value.
    fn to_i64(&self) -> i64;
}

impl ResultToI64 for u64 {
    fn to_i64(&self) -> i64 {
        i64::try_from(*self).unwrap_or(i64::MAX)
    }
}

impl ResultToI64 for i64 {
    fn to_i64(&self) -> i64 {
        *self
    }
}

impl ResultToI64 for Option<i64> {
    fn to_i64(&self) -> i64 {
        self.unwrap_or(0)
    }
}

impl ResultToI64 for Option<f64> {
    fn to_i64(&self) -> i64 {
        #[allow(clippy::cast_possible_truncation)]
        self.map(|f| f as i64).unwrap_or(0)
    }
}

/// Partial aggregate for one key in one slice.
///
/// Partials from different worker threads and different slices are combined
/// with [`merge`](Accumulator::merge), so `merge` must be associative and
/// commutative.
///
/// Every accumulator reduces to a `(value, count)` pair through
/// [`to_parts`](Accumulator::to_parts), which is what spill files store.
pub trait Accumulator: Default + Clone + Send {
    /// The output type produced by the aggregation.
    type Output: ResultToI64;

    /// Adds a value.
    fn add(&mut self, value: i64);

    /// Merges another accumulator into this one.
    fn merge(&mut self, other: &Self);

    /// Extracts the final result.
    fn result(&self) -> Self::Output;

    /// Returns true if no value was added.
    fn is_empty(&self) -> bool;

    /// Raw state as `(value, count)`.
    fn to_parts(&self) -> (i64, u64);

    /// Rebuilds an accumulator from [`to_parts`](Accumulator::to_parts).
    fn from_parts(value: i64, count: u64) -> Self;
}

/// Counts values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    type Output = u64;

    fn add(&mut self, _value: i64) {
        self.count += 1;
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
    }

    fn result(&self) -> u64 {
        self.count
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn to_parts(&self) -> (i64, u64) {
        (0, self.count)
    }

    fn from_parts(_value: i64, count: u64) -> Self {
        Self { count }
    }
}

/// Sums values with wrapping arithmetic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SumAccumulator {
    sum: i64,
    count: u64,
}

impl Accumulator for SumAccumulator {
    type Output = i64;

    fn add(&mut self, value: i64) {
        self.sum = self.sum.wrapping_add(value);
        self.count += 1;
    }

    fn merge(&mut self, other: &Self) {
        self.sum = self.sum.wrapping_add(other.sum);
        self.count += other.count;
    }

    fn result(&self) -> i64 {
        self.sum
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn to_parts(&self) -> (i64, u64) {
        (self.sum, self.count)
    }

    fn from_parts(value: i64, count: u64) -> Self {
        Self { sum: value, count }
    }
}

/// Minimum value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinAccumulator {
    min: Option<i64>,
}

impl Accumulator for MinAccumulator {
    type Output = Option<i64>;

    fn add(&mut self, value: i64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
    }

    fn merge(&mut self, other: &Self) {
        if let Some(other_min) = other.min {
            self.add(other_min);
        }
    }

    fn result(&self) -> Option<i64> {
        self.min
    }

    fn is_empty(&self) -> bool {
        self.min.is_none()
    }

    fn to_parts(&self) -> (i64, u64) {
        self.min.map_or((0, 0), |m| (m, 1))
    }

    fn from_parts(value: i64, count: u64) -> Self {
        Self {
            min: (count > 0).then_some(value),
        }
    }
}

/// Maximum value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaxAccumulator {
    max: Option<i64>,
}

impl Accumulator for MaxAccumulator {
    type Output = Option<i64>;

    fn add(&mut self, value: i64) {
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    fn merge(&mut self, other: &Self) {
        if let Some(other_max) = other.max {
            self.add(other_max);
        }
    }

    fn result(&self) -> Option<i64> {
        self.max
    }

    fn is_empty(&self) -> bool {
        self.max.is_none()
    }

    fn to_parts(&self) -> (i64, u64) {
        self.max.map_or((0, 0), |m| (m, 1))
    }

    fn from_parts(value: i64, count: u64) -> Self {
        Self {
            max: (count > 0).then_some(value),
        }
    }
}

/// Arithmetic mean.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvgAccumulator {
    sum: i64,
    count: u64,
}

impl Accumulator for AvgAccumulator {
    type Output = Option<f64>;

    fn add(&mut self, value: i64) {
        self.sum = self.sum.wrapping_add(value);
        self.count += 1;
    }

    fn merge(&mut self, other: &Self) {
        self.sum = self.sum.wrapping_add(other.sum);
        self.count += other.count;
    }

    #[allow(clippy::cast_precision_loss)]
    fn result(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn to_parts(&self) -> (i64, u64) {
        (self.sum, self.count)
    }

    fn from_parts(value: i64, count: u64) -> Self {
        Self { sum: value, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold<A: Accumulator>(values: &[i64]) -> A {
        let mut acc = A::default();
        for v in values {
            acc.add(*v);
        }
        acc
    }

    #[test]
    fn test_count_and_sum() {
        let mut count: CountAccumulator = fold(&[1, 2, 3]);
        count.merge(&fold(&[4]));
        assert_eq!(count.result(), 4);

        let mut sum: SumAccumulator = fold(&[1, 2, 3]);
        sum.merge(&fold(&[-10]));
        assert_eq!(sum.result(), -4);
    }

    #[test]
    fn test_min_max_empty() {
        let min = MinAccumulator::default();
        assert!(min.is_empty());
        assert_eq!(min.result().to_i64(), 0);

        let mut max: MaxAccumulator = fold(&[3, 9, -2]);
        max.merge(&MaxAccumulator::default());
        assert_eq!(max.result(), Some(9));
        let min: MinAccumulator = fold(&[3, 9, -2]);
        assert_eq!(min.result(), Some(-2));
    }

    #[test]
    fn test_avg_merge() {
        let mut avg: AvgAccumulator = fold(&[1, 2]);
        avg.merge(&fold(&[6]));
        assert_eq!(avg.result(), Some(3.0));
        assert_eq!(AvgAccumulator::default().result(), None);
    }

    #[test]
    fn test_parts_restore_state() {
        let min: MinAccumulator = fold(&[5, 4]);
        let (value, count) = min.to_parts();
        assert_eq!(MinAccumulator::from_parts(value, count), min);
        assert!(MinAccumulator::from_parts(0, 0).is_empty());

        let avg: AvgAccumulator = fold(&[10, 20]);
        let (value, count) = avg.to_parts();
        assert_eq!(AvgAccumulator::from_parts(value, count).result(), Some(15.0));
    }
}
