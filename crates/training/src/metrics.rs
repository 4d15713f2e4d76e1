use model::LossRecord;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    images_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            images_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, images: u64, record: &LossRecord, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.images_processed = self.images_processed.saturating_add(images);
        let step_images_per_sec = if step_duration > Duration::ZERO {
            images as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let loss_avg = self.loss_ema.update(record.total as f64);
        let throughput_avg = self.throughput_ema.update(step_images_per_sec);

        StepSnapshot {
            loss: loss_avg,
            step_loss: record.total as f64,
            reconstruction: record.reconstruction as f64,
            kld: record.kld as f64,
            images,
            step_images_per_sec,
            images_per_sec: throughput_avg,
            grad_norm,
            total_images: self.images_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub reconstruction: f64,
    pub kld: f64,
    pub images: u64,
    pub step_images_per_sec: f64,
    pub images_per_sec: f64,
    pub grad_norm: f64,
    pub total_images: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Sample-weighted running means over one pass through a data split.
#[derive(Debug, Default)]
pub struct EpochMetrics {
    loss_sum: f64,
    reconstruction_sum: f64,
    kld_sum: f64,
    sample_count: u64,
}

impl EpochMetrics {
    pub fn update(&mut self, record: &LossRecord, samples: u64) {
        self.loss_sum += record.total as f64 * samples as f64;
        self.reconstruction_sum += record.reconstruction as f64 * samples as f64;
        self.kld_sum += record.kld as f64 * samples as f64;
        self.sample_count += samples;
    }

    pub fn finalize(self) -> Option<EpochSummary> {
        if self.sample_count == 0 {
            None
        } else {
            let n = self.sample_count as f64;
            Some(EpochSummary {
                average_loss: self.loss_sum / n,
                average_reconstruction: self.reconstruction_sum / n,
                average_kld: self.kld_sum / n,
                samples: self.sample_count,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub average_loss: f64,
    pub average_reconstruction: f64,
    pub average_kld: f64,
    pub samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(8.0), 6.0);
    }

    #[test]
    fn epoch_metrics_weight_by_batch_size() {
        let mut metrics = EpochMetrics::default();
        metrics.update(
            &LossRecord {
                total: 2.0,
                reconstruction: 1.5,
                kld: 0.5,
            },
            3,
        );
        metrics.update(
            &LossRecord {
                total: 4.0,
                reconstruction: 3.0,
                kld: 1.0,
            },
            1,
        );

        let summary = metrics.finalize().unwrap();
        assert_eq!(summary.samples, 4);
        assert!((summary.average_loss - 2.5).abs() < 1e-9);
        assert!((summary.average_reconstruction - 1.875).abs() < 1e-9);
        assert!((summary.average_kld - 0.625).abs() < 1e-9);
    }

    #[test]
    fn empty_epoch_finalizes_to_none() {
        assert!(EpochMetrics::default().finalize().is_none());
    }
}
