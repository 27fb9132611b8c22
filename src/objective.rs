//! 学習ループに渡す損失関数の組み立て。
//!
//! データ損失と物理損失を足し合わせ、`backward()` に渡せる 1 要素のテンソルを返します。

use crate::error::{PhysicsError, Result as PhysicsResult, ensure_same_shape};
use crate::finite_difference::{FiniteDifference, interior};
use crate::grid::Grid;
use crate::loss::{H1LossConfig, H1RelLoss, RelativeLossConfig, RelativeLpLoss};
use crate::residual::Residual;
use burn::config::Config;
use burn::nn::loss::{HuberLoss, HuberLossConfig, MseLoss, Reduction};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use std::fmt;

/// 予測と正解から計算する損失。
pub trait DataLoss<B: Backend, const D: usize> {
    fn forward(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> PhysicsResult<Tensor<B, 1>>;
}

impl<B: Backend, const D: usize> DataLoss<B, D> for RelativeLpLoss {
    fn forward(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> PhysicsResult<Tensor<B, 1>> {
        RelativeLpLoss::forward(self, pred, target)
    }
}

impl<B: Backend> DataLoss<B, 3> for H1RelLoss {
    fn forward(&self, pred: Tensor<B, 3>, target: Tensor<B, 3>) -> PhysicsResult<Tensor<B, 1>> {
        self.forward_1d(pred, target)
    }
}

impl<B: Backend> DataLoss<B, 4> for H1RelLoss {
    fn forward(&self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> PhysicsResult<Tensor<B, 1>> {
        self.forward_2d(pred, target)
    }
}

/// 平均二乗誤差 (burn の `MseLoss`)。
#[derive(Debug, Clone, Default)]
pub struct MeanSquaredError;

impl<B: Backend, const D: usize> DataLoss<B, D> for MeanSquaredError {
    fn forward(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> PhysicsResult<Tensor<B, 1>> {
        ensure_same_shape("pred/target", &target.dims(), &pred.dims())?;
        Ok(MseLoss::new().forward(pred, target, Reduction::Mean))
    }
}

/// Smooth L¹ 損失 (burn の `HuberLoss`, delta = 1)。
#[derive(Debug, Clone)]
pub struct SmoothL1 {
    huber: HuberLoss,
}

impl Default for SmoothL1 {
    fn default() -> Self {
        Self {
            huber: HuberLossConfig::new(1.0).init(),
        }
    }
}

impl<B: Backend, const D: usize> DataLoss<B, D> for SmoothL1 {
    fn forward(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> PhysicsResult<Tensor<B, 1>> {
        ensure_same_shape("pred/target", &target.dims(), &pred.dims())?;
        Ok(self.huber.forward(pred, target, Reduction::Mean))
    }
}

/// 学習に使うデータ損失の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LossKind {
    /// 相対 L¹
    L1,
    /// 相対 L²
    L2,
    /// 相対 H¹
    H1,
    /// Smooth L¹
    L1Smooth,
    /// 平均二乗誤差
    Mse,
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LossKind::L1 => "L1",
            LossKind::L2 => "L2",
            LossKind::H1 => "H1",
            LossKind::L1Smooth => "L1_SMOOTH",
            LossKind::Mse => "MSE",
        };
        f.write_str(name)
    }
}

impl LossKind {
    /// `(batch, n, channels)` を扱う 1次元問題の損失を作ります。
    pub fn data_loss_1d<B: Backend>(&self, beta: f64) -> PhysicsResult<Box<dyn DataLoss<B, 3>>> {
        Ok(match self {
            LossKind::H1 => Box::new(H1LossConfig::new().with_beta(beta).init()),
            _ => self.pointwise::<B, 3>()?,
        })
    }

    /// `(batch, nx, ny, channels)` を扱う 2次元問題の損失を作ります。
    pub fn data_loss_2d<B: Backend>(&self, beta: f64) -> PhysicsResult<Box<dyn DataLoss<B, 4>>> {
        Ok(match self {
            LossKind::H1 => Box::new(H1LossConfig::new().with_beta(beta).init()),
            _ => self.pointwise::<B, 4>()?,
        })
    }

    fn pointwise<B: Backend, const D: usize>(&self) -> PhysicsResult<Box<dyn DataLoss<B, D>>> {
        Ok(match self {
            LossKind::L1 => Box::new(RelativeLossConfig::new(1).init()?),
            LossKind::L2 | LossKind::H1 => Box::new(RelativeLossConfig::new(2).init()?),
            LossKind::L1Smooth => Box::new(SmoothL1::default()),
            LossKind::Mse => Box::new(MeanSquaredError),
        })
    }
}

/// 予測とモデル入力から計算する物理損失。
pub trait PhysicsLoss<B: Backend, const D: usize> {
    fn loss(&self, pred: Tensor<B, D>, input: Tensor<B, D>) -> PhysicsResult<Tensor<B, 1>>;
}

/// 物理損失を使わない場合の既定値 (常に 0)。
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPhysics;

impl<B: Backend, const D: usize> PhysicsLoss<B, D> for NoPhysics {
    fn loss(&self, pred: Tensor<B, D>, _input: Tensor<B, D>) -> PhysicsResult<Tensor<B, 1>> {
        Ok(Tensor::zeros([1], &pred.device()))
    }
}

#[derive(Config, Debug)]
pub struct ResidualLossConfig {
    /// 物理損失に掛ける重み
    #[config(default = 1.0)]
    pub weight: f64,
}

/// 差分法の残差の二乗平均を物理損失とします。
///
/// 予測とモデル入力は `(batch, nx, ny, 1)` で、モデル入力が残差の追加入力
/// (ポアソンなら右辺、ダルシーなら係数場) になります。境界付近は除外します。
///
/// 微分は常に [`FiniteDifference`] で計算します。[`crate::Autograd`] の場
/// ([`crate::Var`]) は座標から組み立てた式しか微分できず、モデルの出力テンソルには
/// 使えないためです。グリッドも差分法用のものを渡してください。
#[derive(Debug, Clone)]
pub struct ResidualLoss<B: Backend, R> {
    residual: R,
    grid: Grid<B>,
    weight: f64,
}

impl ResidualLossConfig {
    pub fn init<B: Backend, R>(&self, residual: R, grid: Grid<B>) -> PhysicsResult<ResidualLoss<B, R>>
    where
        R: Residual<B, Input = Tensor<B, 3>>,
    {
        let [_, nx, ny] = grid.as_2d()?.dims();
        let margin = residual.unreliable_margin(&FiniteDifference);
        for (axis, n) in [(1, nx), (2, ny)] {
            if n <= 2 * margin {
                return Err(PhysicsError::InsufficientResolution {
                    axis,
                    len: n,
                    required: 2 * margin + 1,
                });
            }
        }
        Ok(ResidualLoss {
            residual,
            grid,
            weight: self.weight,
        })
    }
}

impl<B, R> PhysicsLoss<B, 4> for ResidualLoss<B, R>
where
    B: Backend,
    R: Residual<B, Input = Tensor<B, 3>>,
{
    fn loss(&self, pred: Tensor<B, 4>, input: Tensor<B, 4>) -> PhysicsResult<Tensor<B, 1>> {
        ensure_same_shape("pred/input", &pred.dims(), &input.dims())?;
        let channels = pred.dims()[3];
        if channels != 1 {
            return Err(PhysicsError::ShapeMismatch {
                context: "physics loss expects a single output channel",
                expected: vec![1],
                found: vec![channels],
            });
        }
        let u = pred.squeeze::<3>(3);
        let extra = input.squeeze::<3>(3);
        let engine = FiniteDifference;
        let residual = self.residual.evaluate(&engine, &u, &self.grid, &extra)?;
        let residual = interior(residual, self.residual.unreliable_margin(&engine))?;
        let zeros = Tensor::zeros_like(&residual);
        Ok(MseLoss::new()
            .forward(residual, zeros, Reduction::Mean)
            .mul_scalar(self.weight))
    }
}

/// データ損失と物理損失の和。
pub struct TrainingLoss<B: Backend, const D: usize, P = NoPhysics> {
    data: Box<dyn DataLoss<B, D>>,
    physics: P,
}

impl<B: Backend, const D: usize> TrainingLoss<B, D, NoPhysics> {
    pub fn new(data: Box<dyn DataLoss<B, D>>) -> Self {
        Self {
            data,
            physics: NoPhysics,
        }
    }
}

impl<B: Backend, const D: usize, P: PhysicsLoss<B, D>> TrainingLoss<B, D, P> {
    /// 物理損失を差し替えます。
    pub fn with_physics<Q: PhysicsLoss<B, D>>(self, physics: Q) -> TrainingLoss<B, D, Q> {
        TrainingLoss {
            data: self.data,
            physics,
        }
    }

    pub fn forward(
        &self,
        pred: Tensor<B, D>,
        target: Tensor<B, D>,
        input: Tensor<B, D>,
    ) -> PhysicsResult<Tensor<B, 1>> {
        let data = self.data.forward(pred.clone(), target)?;
        let physics = self.physics.loss(pred, input)?;
        Ok(data + physics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use crate::residual::DarcyResidual;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f64>;

    #[test]
    fn loss_names_parse_through_clap() {
        use clap::ValueEnum;
        assert_eq!(LossKind::from_str("l1-smooth", true).unwrap(), LossKind::L1Smooth);
        assert_eq!(LossKind::from_str("H1", true).unwrap(), LossKind::H1);
        assert!(LossKind::from_str("l3", true).is_err());
        assert_eq!(LossKind::L1Smooth.to_string(), "L1_SMOOTH");
    }

    #[test]
    fn residual_loss_config_survives_json() {
        let config = ResidualLossConfig::new().with_weight(0.25);
        let loaded = ResidualLossConfig::load_binary(config.to_string().as_bytes()).unwrap();
        assert_eq!(loaded.weight, 0.25);
    }

    #[test]
    fn residual_loss_needs_inner_points_for_its_stencil() {
        let device = Default::default();
        let grid = crate::grid::GridFactory::<TestBackend>::new(
            crate::grid::GridConfig::new(),
            crate::derivatives::DerivativeStrategy::FiniteDifference,
            &device,
        )
        .grid(&[1, 4, 8])
        .unwrap();
        let coefficient = Tensor::<TestBackend, 3>::ones([1, 4, 8], &device);
        let result = ResidualLossConfig::new().init(DarcyResidual::new(coefficient), grid);
        assert!(matches!(
            result,
            Err(PhysicsError::InsufficientResolution {
                axis: 1,
                len: 4,
                required: 5
            })
        ));
    }

    #[test]
    fn no_physics_contributes_nothing() {
        let device = Default::default();
        let pred = Tensor::<TestBackend, 4>::ones([2, 3, 3, 1], &device);
        let target = pred.clone().mul_scalar(2.0);
        let loss = TrainingLoss::new(LossKind::L1.data_loss_2d::<TestBackend>(1.0).unwrap());
        let value = loss
            .forward(pred.clone(), target, pred)
            .unwrap()
            .into_scalar()
            .elem::<f64>();
        // 2 サンプルそれぞれ 0.5
        assert!((value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mse_and_smooth_l1_agree_for_small_errors() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 3>::zeros([1, 4, 1], &device);
        let pred = Tensor::<TestBackend, 3>::from_floats([[[0.1], [-0.2], [0.3], [0.0]]], &device);
        let mse = DataLoss::<TestBackend, 3>::forward(&MeanSquaredError, pred.clone(), target.clone())
            .unwrap()
            .into_scalar()
            .elem::<f64>();
        let smooth = DataLoss::<TestBackend, 3>::forward(&SmoothL1::default(), pred, target)
            .unwrap()
            .into_scalar()
            .elem::<f64>();
        // |e| < 1 では smooth L1 = 0.5 e²
        assert!((smooth - 0.5 * mse).abs() < 1e-12);
    }
}
