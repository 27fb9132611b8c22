use crate::autograd::{Autograd, Var};
use crate::cli::ResidualKind;
use crate::derivatives::{DerivativeStrategy, FieldOps, SpatialDerivatives};
use crate::error::Result;
use crate::finite_difference::{FiniteDifference, interior};
use crate::grid::{Grid, GridConfig, GridFactory};
use crate::plot::plot_heatmap;
use crate::residual::{DarcyResidual, HelmholtzResidual, PoissonResidual, Residual};
use burn::backend::NdArray;
use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Tensor};
use std::path::Path;
use std::time::Instant;

type MyBackend = NdArray<f32>;

/// 解析解に対する残差の検証結果。
#[derive(Debug, Clone)]
pub struct ResidualCheck<B: Backend> {
    /// 評価した残差 `(batch, nx, ny)`
    pub residual: Tensor<B, 3>,
    /// 解析的に求めた残差
    pub expected: Tensor<B, 3>,
    /// 比較から除外した境界セルの幅
    pub margin: usize,
}

impl<B: Backend> ResidualCheck<B> {
    /// 内点での最大絶対誤差。
    pub fn max_interior_error(&self) -> Result<f64> {
        let diff = self.residual.clone() - self.expected.clone();
        Ok(interior(diff, self.margin)?
            .abs()
            .max()
            .into_scalar()
            .elem::<f64>())
    }
}

/// 解析解 (ポアソン・ダルシーは `x² + y²`、ヘルムホルツは `sin x cos y`) の残差を計算します。
pub fn manufactured_residual<B: Backend>(
    kind: ResidualKind,
    strategy: DerivativeStrategy,
    nx: usize,
    ny: usize,
    device: &B::Device,
) -> Result<ResidualCheck<B>> {
    let grid = GridFactory::<B>::new(GridConfig::new(), strategy, device).grid(&[1, nx, ny])?;
    match strategy {
        DerivativeStrategy::Autograd => evaluate_with(&Autograd, kind, &grid, |u| u),
        DerivativeStrategy::FiniteDifference => {
            evaluate_with(&FiniteDifference, kind, &grid, |u| u.value())
        }
    }
}

fn evaluate_with<B, S>(
    engine: &S,
    kind: ResidualKind,
    grid: &Grid<B>,
    to_field: impl Fn(Var<B, 3>) -> S::Field<3>,
) -> Result<ResidualCheck<B>>
where
    B: Backend,
    S: SpatialDerivatives<B>,
{
    let coords = grid.as_2d()?;
    let (x, y) = (coords.x(), coords.y());
    match kind {
        ResidualKind::Poisson => {
            let u = x.mul(&x).add(&y.mul(&y));
            let rhs = Tensor::ones_like(&u.value()).mul_scalar(4.0);
            let residual = PoissonResidual::new().evaluate(engine, &to_field(u), grid, &rhs)?;
            Ok(ResidualCheck {
                expected: Tensor::zeros_like(&rhs),
                residual: residual.value(),
                margin: Residual::<B>::unreliable_margin(&PoissonResidual::new(), engine),
            })
        }
        ResidualKind::Darcy => {
            let u = x.mul(&x).add(&y.mul(&y));
            let ones = Tensor::ones_like(&u.value());
            let darcy = DarcyResidual::new(ones.clone());
            let residual = darcy.evaluate(engine, &to_field(u), grid, &ones)?;
            Ok(ResidualCheck {
                expected: ones.mul_scalar(5.0),
                residual: residual.value(),
                margin: darcy.unreliable_margin(engine),
            })
        }
        ResidualKind::Helmholtz => {
            let u = x.sin().mul(&y.cos());
            let expected = u.value().mul_scalar(2.0);
            let residual = HelmholtzResidual::new().evaluate(engine, &to_field(u), grid, &2.0)?;
            Ok(ResidualCheck {
                expected,
                residual: residual.value(),
                margin: Residual::<B>::unreliable_margin(&HelmholtzResidual::new(), engine),
            })
        }
    }
}

/// `residual`サブコマンドを実行します。
pub fn run(
    kind: ResidualKind,
    strategy: DerivativeStrategy,
    nx: usize,
    ny: usize,
    plot: Option<&Path>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let device = Default::default();

    println!(
        "残差を検証します ({:?}, {}) - 格子: {}x{}, バックエンド: NdArray (CPU)",
        kind, strategy, nx, ny
    );
    let start = Instant::now();
    let check = manufactured_residual::<MyBackend>(kind, strategy, nx, ny, &device)?;
    let max_error = check.max_interior_error()?;
    let duration = start.elapsed();
    tracing::info!(?kind, %strategy, nx, ny, max_error, "residual check finished");

    println!(
        "=> 内点 (境界から {} セルを除外) での最大誤差: {:.3e}",
        check.margin, max_error
    );
    println!("=> 計算時間: {:.2?}", duration);

    if let Some(path) = plot {
        let values = check
            .residual
            .clone()
            .into_data()
            .iter::<f64>()
            .collect::<Vec<f64>>();
        let config = GridConfig::new();
        plot_heatmap(
            path,
            &format!("{:?} residual ({})", kind, strategy),
            &values,
            nx,
            ny,
            (config.lower, config.upper),
        )?;
        println!("=> 残差のヒートマップを '{}' に保存しました。", path.display());
    }

    Ok(())
}
