/// Running weighted mean of per-batch values
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageMeter {
    /// Last value passed to `update`
    pub val: f64,
    pub avg: f64,
    pub sum: f64,
    /// Total weight seen so far
    pub count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `val` with weight `n` (typically the batch size)
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() {
        let mut meter = AverageMeter::new();
        meter.update(3.0, 2);
        meter.update(5.0, 1);
        assert!((meter.avg - 11.0 / 3.0).abs() < 1e-12);
        assert_eq!(meter.val, 5.0);
        assert_eq!(meter.count, 3);
    }

    #[test]
    fn test_reset() {
        let mut meter = AverageMeter::new();
        meter.update(1.5, 4);
        meter.reset();
        assert_eq!(meter, AverageMeter::default());
        assert_eq!(meter.sum, 0.0);
    }

    #[test]
    fn test_zero_weight_keeps_average() {
        let mut meter = AverageMeter::new();
        meter.update(2.0, 0);
        assert_eq!(meter.avg, 0.0);
        assert_eq!(meter.val, 2.0);
    }
}
