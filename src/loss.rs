//! 相対ノルム損失。
//!
//! いずれもサンプルごとに `‖pred - target‖ / ‖target‖` を計算してからバッチ方向に
//! 和 (既定) または平均を取ります。`multiout` 版は最後の軸をチャネルとみなし、
//! チャネルごとの値をベクトルで返します。

use crate::error::{PhysicsError, Result as PhysicsResult, ensure_same_shape};
use burn::config::Config;
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// これ以下の目標ノルムはゼロとみなします。
pub const ZERO_NORM_TOLERANCE: f64 = 1e-12;

/// 相対 Lp 損失の設定。
#[derive(Config, Debug)]
pub struct RelativeLossConfig {
    /// ノルムの次数 (1 または 2)
    pub p: u32,
    /// true ならバッチ平均、false ならバッチ和
    #[config(default = false)]
    pub size_mean: bool,
}

impl RelativeLossConfig {
    pub fn init(&self) -> PhysicsResult<RelativeLpLoss> {
        let norm = match self.p {
            1 => LpNorm::L1,
            2 => LpNorm::L2,
            p => return Err(PhysicsError::UnsupportedNorm { p }),
        };
        Ok(RelativeLpLoss {
            norm,
            size_mean: self.size_mean,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LpNorm {
    L1,
    L2,
}

/// 相対 L¹ / L² 損失。
#[derive(Debug, Clone, Copy)]
pub struct RelativeLpLoss {
    norm: LpNorm,
    size_mean: bool,
}

impl RelativeLpLoss {
    /// バッチ軸以外の全要素でノルムを取り、スカラー (`[1]`) を返します。
    pub fn forward<B: Backend, const D: usize>(
        &self,
        pred: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> PhysicsResult<Tensor<B, 1>> {
        ensure_same_shape("pred/target", &target.dims(), &pred.dims())?;
        let ratios = self.ratios(as_samples(pred), as_samples(target), false)?;
        Ok(reduce_batch(ratios, self.size_mean).reshape([1]))
    }

    /// チャネル (最後の軸) ごとの損失を `[channels]` のベクトルで返します。
    pub fn forward_multiout<B: Backend, const D: usize>(
        &self,
        pred: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> PhysicsResult<Tensor<B, 1>> {
        ensure_same_shape("pred/target", &target.dims(), &pred.dims())?;
        let ratios = self.ratios(as_channels(pred), as_channels(target), true)?;
        Ok(reduce_batch(ratios, self.size_mean))
    }

    fn ratios<B: Backend>(
        &self,
        pred: Tensor<B, 3>,
        target: Tensor<B, 3>,
        per_channel: bool,
    ) -> PhysicsResult<Tensor<B, 2>> {
        let numerator = lp_norms(pred - target.clone(), self.norm);
        let denominator = lp_norms(target, self.norm);
        check_nonzero(&denominator, per_channel)?;
        Ok(numerator / denominator)
    }
}

/// H¹ 型相対損失の設定。
///
/// 二乗ノルムを `alpha ‖e‖² + beta ‖∇e‖²` とします。`alpha = 0` で semi-H¹ になります。
#[derive(Config, Debug)]
pub struct H1LossConfig {
    /// 勾配項の重み
    #[config(default = 1.0)]
    pub beta: f64,
    /// 値の項の重み
    #[config(default = 1.0)]
    pub alpha: f64,
    #[config(default = false)]
    pub size_mean: bool,
    /// 各空間軸の長さ (差分の刻み幅の計算に使います)
    #[config(default = 1.0)]
    pub domain_length: f64,
}

impl H1LossConfig {
    pub fn init(&self) -> H1RelLoss {
        H1RelLoss {
            beta: self.beta,
            alpha: self.alpha,
            size_mean: self.size_mean,
            domain_length: self.domain_length,
        }
    }
}

/// H¹ / semi-H¹ 相対損失。勾配は前進差分で近似します。
#[derive(Debug, Clone, Copy)]
pub struct H1RelLoss {
    beta: f64,
    alpha: f64,
    size_mean: bool,
    domain_length: f64,
}

impl H1RelLoss {
    /// `(batch, n, channels)` の 1次元問題。
    pub fn forward_1d<B: Backend>(
        &self,
        pred: Tensor<B, 3>,
        target: Tensor<B, 3>,
    ) -> PhysicsResult<Tensor<B, 1>> {
        let ratios = self.ratios_1d(pred, target, false)?;
        Ok(reduce_batch(ratios, self.size_mean).reshape([1]))
    }

    pub fn forward_1d_multiout<B: Backend>(
        &self,
        pred: Tensor<B, 3>,
        target: Tensor<B, 3>,
    ) -> PhysicsResult<Tensor<B, 1>> {
        let ratios = self.ratios_1d(pred, target, true)?;
        Ok(reduce_batch(ratios, self.size_mean))
    }

    /// `(batch, nx, ny, channels)` の 2次元問題。
    pub fn forward_2d<B: Backend>(
        &self,
        pred: Tensor<B, 4>,
        target: Tensor<B, 4>,
    ) -> PhysicsResult<Tensor<B, 1>> {
        let ratios = self.ratios_2d(pred, target, false)?;
        Ok(reduce_batch(ratios, self.size_mean).reshape([1]))
    }

    pub fn forward_2d_multiout<B: Backend>(
        &self,
        pred: Tensor<B, 4>,
        target: Tensor<B, 4>,
    ) -> PhysicsResult<Tensor<B, 1>> {
        let ratios = self.ratios_2d(pred, target, true)?;
        Ok(reduce_batch(ratios, self.size_mean))
    }

    fn ratios_1d<B: Backend>(
        &self,
        pred: Tensor<B, 3>,
        target: Tensor<B, 3>,
        per_channel: bool,
    ) -> PhysicsResult<Tensor<B, 2>> {
        ensure_same_shape("pred/target", &target.dims(), &pred.dims())?;
        let h = self.spacing(target.dims()[1], 1)?;
        let numerator = self.squared_1d(pred - target.clone(), h);
        let denominator = self.squared_1d(target, h);
        self.ratio(numerator, denominator, per_channel)
    }

    fn ratios_2d<B: Backend>(
        &self,
        pred: Tensor<B, 4>,
        target: Tensor<B, 4>,
        per_channel: bool,
    ) -> PhysicsResult<Tensor<B, 2>> {
        ensure_same_shape("pred/target", &target.dims(), &pred.dims())?;
        let [_, nx, ny, _] = target.dims();
        let hx = self.spacing(nx, 1)?;
        let hy = self.spacing(ny, 2)?;
        let numerator = self.squared_2d(pred - target.clone(), hx, hy);
        let denominator = self.squared_2d(target, hx, hy);
        self.ratio(numerator, denominator, per_channel)
    }

    fn spacing(&self, n: usize, axis: usize) -> PhysicsResult<f64> {
        if n < 2 {
            return Err(PhysicsError::InsufficientResolution {
                axis,
                len: n,
                required: 2,
            });
        }
        Ok(self.domain_length / (n - 1) as f64)
    }

    /// `[batch, channels]` の二乗 H¹ ノルム。
    fn squared_1d<B: Backend>(&self, e: Tensor<B, 3>, h: f64) -> Tensor<B, 2> {
        let [batch, _, channels] = e.dims();
        let value = e.clone().powf_scalar(2.0).sum_dim(1);
        let grad = forward_difference(e, 1, h).powf_scalar(2.0).sum_dim(1);
        (value.mul_scalar(self.alpha) + grad.mul_scalar(self.beta)).reshape([batch, channels])
    }

    fn squared_2d<B: Backend>(&self, e: Tensor<B, 4>, hx: f64, hy: f64) -> Tensor<B, 2> {
        let [batch, _, _, channels] = e.dims();
        let value = e.clone().powf_scalar(2.0).sum_dim(1).sum_dim(2);
        let grad_x = forward_difference(e.clone(), 1, hx)
            .powf_scalar(2.0)
            .sum_dim(1)
            .sum_dim(2);
        let grad_y = forward_difference(e, 2, hy)
            .powf_scalar(2.0)
            .sum_dim(1)
            .sum_dim(2);
        (value.mul_scalar(self.alpha) + (grad_x + grad_y).mul_scalar(self.beta))
            .reshape([batch, channels])
    }

    fn ratio<B: Backend>(
        &self,
        numerator: Tensor<B, 2>,
        denominator: Tensor<B, 2>,
        per_channel: bool,
    ) -> PhysicsResult<Tensor<B, 2>> {
        let (numerator, denominator) = if per_channel {
            (numerator, denominator)
        } else {
            (numerator.sum_dim(1), denominator.sum_dim(1))
        };
        let denominator = denominator.sqrt();
        check_nonzero(&denominator, per_channel)?;
        Ok(numerator.sqrt() / denominator)
    }
}

/// 軸 `axis` に沿った前進差分 (長さが 1 減ります)。
fn forward_difference<B: Backend, const D: usize>(
    t: Tensor<B, D>,
    axis: usize,
    h: f64,
) -> Tensor<B, D> {
    let dims = t.dims();
    let n = dims[axis];
    let mut ahead = dims.map(|d| 0..d);
    ahead[axis] = 1..n;
    let mut behind = dims.map(|d| 0..d);
    behind[axis] = 0..n - 1;
    (t.clone().slice(ahead) - t.slice(behind)).div_scalar(h)
}

/// `(batch, ...)` を `(batch, m, 1)` に並べ替えます。
fn as_samples<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, 3> {
    let dims = t.dims();
    let m = dims.iter().skip(1).product::<usize>();
    t.reshape([dims[0], m, 1])
}

/// `(batch, ..., channels)` を `(batch, m, channels)` に並べ替えます。
fn as_channels<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, 3> {
    let dims = t.dims();
    if D < 2 {
        return t.reshape([dims[0], 1, 1]);
    }
    let channels = dims[D - 1];
    let m = dims[1..D - 1].iter().product::<usize>();
    t.reshape([dims[0], m, channels])
}

/// `[batch, channels]` のノルム。
fn lp_norms<B: Backend>(t: Tensor<B, 3>, norm: LpNorm) -> Tensor<B, 2> {
    let [batch, _, channels] = t.dims();
    let summed = match norm {
        LpNorm::L1 => t.abs().sum_dim(1),
        LpNorm::L2 => t.powf_scalar(2.0).sum_dim(1).sqrt(),
    };
    summed.reshape([batch, channels])
}

fn check_nonzero<B: Backend>(norms: &Tensor<B, 2>, per_channel: bool) -> PhysicsResult<()> {
    let [_, channels] = norms.dims();
    for (i, norm) in norms.to_data().iter::<f64>().enumerate() {
        // NaN もここで弾く
        if !(norm > ZERO_NORM_TOLERANCE) {
            let sample = i / channels;
            let channel = per_channel.then_some(i % channels);
            tracing::warn!(sample, ?channel, norm, "target norm is zero");
            return Err(PhysicsError::DivisionByZeroNorm {
                sample,
                channel,
                norm,
            });
        }
    }
    Ok(())
}

/// `[batch, channels]` をバッチ方向に集約して `[channels]` にします。
fn reduce_batch<B: Backend>(ratios: Tensor<B, 2>, size_mean: bool) -> Tensor<B, 1> {
    let [batch, channels] = ratios.dims();
    let summed = ratios.sum_dim(0).reshape([channels]);
    if size_mean {
        summed.div_scalar(batch as f64)
    } else {
        summed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f64>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    #[test]
    fn hand_computed_relative_norms() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0], [1.0, 0.0]], &device);
        let pred = Tensor::<TestBackend, 2>::from_floats([[3.0, 5.0], [0.0, 0.0]], &device);

        // L1: |1| / 7 + |1| / 1
        let l1 = RelativeLossConfig::new(1).init().unwrap();
        let value = scalar(l1.forward(pred.clone(), target.clone()).unwrap());
        assert!((value - (1.0 / 7.0 + 1.0)).abs() < 1e-12);

        // L2 (mean): (1/5 + 1/1) / 2
        let l2 = RelativeLossConfig::new(2)
            .with_size_mean(true)
            .init()
            .unwrap();
        let value = scalar(l2.forward(pred, target).unwrap());
        assert!((value - 0.6).abs() < 1e-12);
    }

    #[test]
    fn unsupported_p() {
        assert_eq!(
            RelativeLossConfig::new(3).init().unwrap_err(),
            PhysicsError::UnsupportedNorm { p: 3 }
        );
    }

    #[test]
    fn zero_target_raises() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0], [0.0, 0.0]], &device);
        let pred = Tensor::<TestBackend, 2>::ones([2, 2], &device);
        let err = RelativeLossConfig::new(2)
            .init()
            .unwrap()
            .forward(pred, target)
            .unwrap_err();
        assert!(matches!(
            err,
            PhysicsError::DivisionByZeroNorm {
                sample: 1,
                channel: None,
                ..
            }
        ));
    }

    #[test]
    fn shape_mismatch() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let pred = Tensor::<TestBackend, 2>::ones([2, 4], &device);
        assert!(matches!(
            RelativeLossConfig::new(1).init().unwrap().forward(pred, target),
            Err(PhysicsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn semi_h1_ignores_constant_offsets() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 3>::from_floats([[[0.0], [1.0], [2.0], [3.0]]], &device);
        let pred = target.clone().add_scalar(5.0);
        let semi = H1LossConfig::new().with_alpha(0.0).init();
        assert!(scalar(semi.forward_1d(pred.clone(), target.clone()).unwrap()).abs() < 1e-12);

        let full = H1LossConfig::new().init();
        assert!(scalar(full.forward_1d(pred, target).unwrap()) > 0.0);
    }

    #[test]
    fn h1_of_linear_profile() {
        let device = Default::default();
        // target = x on [0, 1] with 3 points, pred = 2x
        let target = Tensor::<TestBackend, 3>::from_floats([[[0.0], [0.5], [1.0]]], &device);
        let pred = target.clone().mul_scalar(2.0);
        // values: ‖x‖² = 1.25, gradient: two differences of slope 1 → 2
        // ratio = sqrt(1.25 + 2) / sqrt(1.25 + 2) = 1 for an error equal to the target
        let loss = H1LossConfig::new().init();
        let value = scalar(loss.forward_1d(pred, target).unwrap());
        assert!((value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn h1_2d_multiout_vector_length() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 4>::ones([2, 4, 5, 3], &device);
        let pred = target.clone().mul_scalar(1.1);
        let out = H1LossConfig::new()
            .init()
            .forward_2d_multiout(pred, target)
            .unwrap();
        assert_eq!(out.dims(), [3]);
    }
}
