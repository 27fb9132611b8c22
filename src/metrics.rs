use crate::error::{PhysicsError, Result};
use crate::loss::{H1LossConfig, H1RelLoss, RelativeLossConfig, RelativeLpLoss};
use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Tensor};

/// 検証で報告する指標の平均値。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricSummary {
    pub relative_l1: f64,
    pub relative_l2: f64,
    pub relative_semi_h1: f64,
    pub relative_h1: f64,
    pub train_loss: f64,
}

struct Norms {
    l1: RelativeLpLoss,
    l2: RelativeLpLoss,
    semi_h1: H1RelLoss,
    h1: H1RelLoss,
}

impl Norms {
    /// 検証では H¹ の beta を 1 に固定します。
    fn new() -> Result<Self> {
        Ok(Self {
            l1: RelativeLossConfig::new(1).init()?,
            l2: RelativeLossConfig::new(2).init()?,
            semi_h1: H1LossConfig::new().with_alpha(0.0).init(),
            h1: H1LossConfig::new().init(),
        })
    }
}

fn to_vec<B: Backend>(t: Tensor<B, 1>) -> Vec<f64> {
    t.into_data().iter::<f64>().collect()
}

/// テストセットの相対誤差をバッチごとに足し込み、サンプル数で割って平均します。
///
/// 損失はバッチ和で計算されるので、`summary` の値はサンプルあたりの平均になります。
pub struct ValidationMetrics {
    problem_dim: usize,
    norms: Norms,
    sums: [f64; 4],
    test_samples: usize,
    train_loss: f64,
    train_samples: usize,
}

impl ValidationMetrics {
    /// `problem_dim` は 1 または 2。
    pub fn new(problem_dim: usize) -> Result<Self> {
        if !(1..=2).contains(&problem_dim) {
            return Err(PhysicsError::UnsupportedProblemDimension { dim: problem_dim });
        }
        Ok(Self {
            problem_dim,
            norms: Norms::new()?,
            sums: [0.0; 4],
            test_samples: 0,
            train_loss: 0.0,
            train_samples: 0,
        })
    }

    /// `(batch, n, channels)` の 1次元バッチを追加します。
    pub fn update_1d<B: Backend>(&mut self, pred: Tensor<B, 3>, target: Tensor<B, 3>) -> Result<()> {
        self.expect_dim(1)?;
        let batch = target.dims()[0];
        let values = [
            self.norms.l1.forward(pred.clone(), target.clone())?,
            self.norms.l2.forward(pred.clone(), target.clone())?,
            self.norms.semi_h1.forward_1d(pred.clone(), target.clone())?,
            self.norms.h1.forward_1d(pred, target)?,
        ];
        self.add(values, batch);
        Ok(())
    }

    /// `(batch, nx, ny, channels)` の 2次元バッチを追加します。
    pub fn update_2d<B: Backend>(&mut self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Result<()> {
        self.expect_dim(2)?;
        let batch = target.dims()[0];
        let values = [
            self.norms.l1.forward(pred.clone(), target.clone())?,
            self.norms.l2.forward(pred.clone(), target.clone())?,
            self.norms.semi_h1.forward_2d(pred.clone(), target.clone())?,
            self.norms.h1.forward_2d(pred, target)?,
        ];
        self.add(values, batch);
        Ok(())
    }

    /// 学習セットで計算した損失 (バッチ和) を追加します。
    pub fn update_train_loss<B: Backend>(&mut self, loss: Tensor<B, 1>, batch: usize) {
        self.train_loss += loss.into_scalar().elem::<f64>();
        self.train_samples += batch;
    }

    pub fn summary(&self) -> MetricSummary {
        let per_sample = |sum: f64, count: usize| {
            if count == 0 { 0.0 } else { sum / count as f64 }
        };
        MetricSummary {
            relative_l1: per_sample(self.sums[0], self.test_samples),
            relative_l2: per_sample(self.sums[1], self.test_samples),
            relative_semi_h1: per_sample(self.sums[2], self.test_samples),
            relative_h1: per_sample(self.sums[3], self.test_samples),
            train_loss: per_sample(self.train_loss, self.train_samples),
        }
    }

    fn expect_dim(&self, dim: usize) -> Result<()> {
        if self.problem_dim == dim {
            Ok(())
        } else {
            Err(PhysicsError::UnsupportedProblemDimension { dim })
        }
    }

    fn add<B: Backend>(&mut self, values: [Tensor<B, 1>; 4], batch: usize) {
        for (sum, value) in self.sums.iter_mut().zip(values) {
            *sum += value.into_scalar().elem::<f64>();
        }
        self.test_samples += batch;
    }
}

/// チャネル別の検証指標。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelSummary {
    pub relative_l1: Vec<f64>,
    pub relative_l2: Vec<f64>,
    pub relative_semi_h1: Vec<f64>,
    pub relative_h1: Vec<f64>,
}

/// 出力チャネル (物理量) ごとに相対誤差を集計します。
pub struct ChannelMetrics {
    problem_dim: usize,
    channels: usize,
    norms: Norms,
    sums: [Vec<f64>; 4],
    samples: usize,
}

impl ChannelMetrics {
    pub fn new(problem_dim: usize, channels: usize) -> Result<Self> {
        if !(1..=2).contains(&problem_dim) {
            return Err(PhysicsError::UnsupportedProblemDimension { dim: problem_dim });
        }
        Ok(Self {
            problem_dim,
            channels,
            norms: Norms::new()?,
            sums: std::array::from_fn(|_| vec![0.0; channels]),
            samples: 0,
        })
    }

    pub fn update_1d<B: Backend>(&mut self, pred: Tensor<B, 3>, target: Tensor<B, 3>) -> Result<()> {
        if self.problem_dim != 1 {
            return Err(PhysicsError::UnsupportedProblemDimension { dim: 1 });
        }
        let [batch, _, channels] = target.dims();
        self.expect_channels(channels)?;
        let values = [
            self.norms.l1.forward_multiout(pred.clone(), target.clone())?,
            self.norms.l2.forward_multiout(pred.clone(), target.clone())?,
            self.norms.semi_h1.forward_1d_multiout(pred.clone(), target.clone())?,
            self.norms.h1.forward_1d_multiout(pred, target)?,
        ];
        self.add(values, batch);
        Ok(())
    }

    pub fn update_2d<B: Backend>(&mut self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Result<()> {
        if self.problem_dim != 2 {
            return Err(PhysicsError::UnsupportedProblemDimension { dim: 2 });
        }
        let [batch, _, _, channels] = target.dims();
        self.expect_channels(channels)?;
        let values = [
            self.norms.l1.forward_multiout(pred.clone(), target.clone())?,
            self.norms.l2.forward_multiout(pred.clone(), target.clone())?,
            self.norms.semi_h1.forward_2d_multiout(pred.clone(), target.clone())?,
            self.norms.h1.forward_2d_multiout(pred, target)?,
        ];
        self.add(values, batch);
        Ok(())
    }

    pub fn summary(&self) -> ChannelSummary {
        let average = |sums: &Vec<f64>| {
            sums.iter()
                .map(|s| if self.samples == 0 { 0.0 } else { s / self.samples as f64 })
                .collect::<Vec<_>>()
        };
        ChannelSummary {
            relative_l1: average(&self.sums[0]),
            relative_l2: average(&self.sums[1]),
            relative_semi_h1: average(&self.sums[2]),
            relative_h1: average(&self.sums[3]),
        }
    }

    fn expect_channels(&self, channels: usize) -> Result<()> {
        if channels == self.channels {
            Ok(())
        } else {
            Err(PhysicsError::ShapeMismatch {
                context: "output channels",
                expected: vec![self.channels],
                found: vec![channels],
            })
        }
    }

    fn add<B: Backend>(&mut self, values: [Tensor<B, 1>; 4], batch: usize) {
        for (sums, value) in self.sums.iter_mut().zip(values) {
            for (sum, v) in sums.iter_mut().zip(to_vec(value)) {
                *sum += v;
            }
        }
        self.samples += batch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f64>;

    #[test]
    fn perfect_prediction_has_zero_errors() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 4>::random(
            [3, 5, 5, 2],
            burn::tensor::Distribution::Uniform(1.0, 2.0),
            &device,
        );
        let mut metrics = ValidationMetrics::new(2).unwrap();
        metrics.update_2d(target.clone(), target.clone()).unwrap();
        let summary = metrics.summary();
        assert_eq!(summary.relative_l1, 0.0);
        assert_eq!(summary.relative_l2, 0.0);
        assert_eq!(summary.relative_semi_h1, 0.0);
        assert_eq!(summary.relative_h1, 0.0);
    }

    #[test]
    fn averages_are_per_sample() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &device)
            .reshape([1, 6, 1])
            .repeat_dim(0, 4);
        let pred = target.clone().mul_scalar(1.5);
        let mut metrics = ValidationMetrics::new(1).unwrap();
        metrics.update_1d(pred.clone(), target.clone()).unwrap();
        metrics.update_1d(pred, target).unwrap();
        let summary = metrics.summary();
        assert!((summary.relative_l1 - 0.5).abs() < 1e-12);
        assert!((summary.relative_l2 - 0.5).abs() < 1e-12);
        assert!((summary.relative_semi_h1 - 0.5).abs() < 1e-12);
        assert!((summary.relative_h1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn dimension_is_checked() {
        assert!(matches!(
            ValidationMetrics::new(3),
            Err(PhysicsError::UnsupportedProblemDimension { dim: 3 })
        ));
        let mut metrics = ValidationMetrics::new(1).unwrap();
        let t = Tensor::<TestBackend, 4>::ones([1, 3, 3, 1], &Default::default());
        assert!(metrics.update_2d(t.clone(), t).is_err());
    }

    #[test]
    fn channel_count_is_checked() {
        let mut metrics = ChannelMetrics::new(2, 3).unwrap();
        let t = Tensor::<TestBackend, 4>::ones([1, 3, 3, 2], &Default::default());
        assert!(matches!(
            metrics.update_2d(t.clone(), t),
            Err(PhysicsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn train_loss_average() {
        let device = Default::default();
        let mut metrics = ValidationMetrics::new(2).unwrap();
        metrics.update_train_loss(Tensor::<TestBackend, 1>::from_floats([3.0], &device), 2);
        metrics.update_train_loss(Tensor::<TestBackend, 1>::from_floats([1.0], &device), 2);
        assert!((metrics.summary().train_loss - 1.0).abs() < 1e-12);
    }
}
