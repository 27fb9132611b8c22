use crate::derivatives::DerivativeStrategy;
use crate::objective::LossKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Physics residuals and relative losses for neural operators with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（residual または losses）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 解析解を使ってPDE残差を検証し、必要ならヒートマップを保存します
    Residual {
        /// 残差の種類
        #[arg(long, value_enum, default_value_t = ResidualKind::Poisson)]
        kind: ResidualKind,
        /// 微分の計算方法
        #[arg(long, value_enum, default_value_t = DerivativeStrategy::FiniteDifference)]
        strategy: DerivativeStrategy,
        /// x方向の格子点数
        #[arg(long, default_value_t = 32)]
        nx: usize,
        /// y方向の格子点数
        #[arg(long, default_value_t = 32)]
        ny: usize,
        /// 残差のヒートマップの保存先 (パス省略時は `residual.png`)
        #[arg(long, num_args = 0..=1, default_missing_value = crate::RESIDUAL_PLOT_FILENAME)]
        plot: Option<PathBuf>,
    },
    /// ノイズを加えた予測に対して損失と検証指標を計算します
    Losses {
        /// 学習に使う損失関数
        #[arg(long, value_enum, default_value_t = LossKind::L2)]
        loss: LossKind,
        /// H¹損失の勾配項の重み
        #[arg(long, default_value_t = 1.0)]
        beta: f64,
        #[arg(long, default_value_t = 8)]
        batch: usize,
        #[arg(long, default_value_t = 32)]
        nx: usize,
        #[arg(long, default_value_t = 32)]
        ny: usize,
        /// 出力チャネル数
        #[arg(long, default_value_t = 2)]
        channels: usize,
        /// 一様ノイズの振幅
        #[arg(long, default_value_t = 0.05)]
        noise: f64,
    },
}

/// 検証するPDE残差の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResidualKind {
    Poisson,
    Darcy,
    Helmholtz,
}
