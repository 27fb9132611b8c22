//! # PINN 残差・損失の検証プログラム
//!
//! `clap` クレートを利用して、コマンドラインから`residual`（残差の検証）と
//! `losses`（損失と検証指標の計算）を個別に実行できます。
//!
//! ## 使い方
//!
//! ### 残差の検証
//! ```bash
//! cargo run --release -- residual --kind darcy --strategy autograd --plot
//! ```
//!
//! ### 損失の計算
//! ```bash
//! cargo run --release -- losses --loss h1 --channels 3
//! ```
//!
//! ログの詳細度は `RUST_LOG` で変更できます（既定は `info`）。

use clap::Parser;
use pinn_residuals::cli::{Cli, Commands};
use pinn_residuals::{check, evaluate};
use tracing_subscriber::EnvFilter;

/// プログラムのエントリーポイント
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Residual {
            kind,
            strategy,
            nx,
            ny,
            plot,
        } => check::run(kind, strategy, nx, ny, plot.as_deref())?,
        Commands::Losses {
            loss,
            beta,
            batch,
            nx,
            ny,
            channels,
            noise,
        } => evaluate::run(loss, beta, batch, nx, ny, channels, noise)?,
    }

    Ok(())
}
