//! # PINN 残差・相対ノルム損失ライブラリ
//!
//! `burn` のテンソルの上で、ニューラルオペレーターの学習に使う物理残差と
//! 相対ノルム損失を計算するコンポーネントを提供します。
//!
//! 依存の向きは グリッド生成 → 空間微分 → PDE 残差 → 損失 の順です。

pub mod autograd;
pub mod check;
pub mod cli;
pub mod derivatives;
pub mod error;
pub mod evaluate;
pub mod finite_difference;
pub mod grid;
pub mod loss;
pub mod metrics;
pub mod objective;
pub mod plot;
pub mod residual;

pub use autograd::{Autograd, Var};
pub use derivatives::{
    DerivativeStrategy, FieldOps, Gradient2d, SecondOrder1d, SecondOrder2d, SpatialDerivatives,
};
pub use error::{PhysicsError, Result};
pub use finite_difference::{FiniteDifference, central_difference, interior, second_difference};
pub use grid::{Grid, Grid1d, Grid2d, GridConfig, GridFactory};
pub use loss::{
    H1LossConfig, H1RelLoss, RelativeLossConfig, RelativeLpLoss, ZERO_NORM_TOLERANCE,
};
pub use metrics::{ChannelMetrics, ChannelSummary, MetricSummary, ValidationMetrics};
pub use objective::{
    DataLoss, LossKind, MeanSquaredError, NoPhysics, PhysicsLoss, ResidualLoss,
    ResidualLossConfig, SmoothL1, TrainingLoss,
};
pub use residual::{DarcyResidual, HelmholtzResidual, PoissonResidual, Residual};

/// 残差のヒートマップを保存する既定のファイル名
pub const RESIDUAL_PLOT_FILENAME: &str = "residual.png";
