//! 中心差分による空間微分。
//!
//! 内点だけを更新し、境界のセルは 0 のまま残します。
//! 呼び出し側はステンシルの深さに応じて [`interior`] で境界を取り除いてください。

use crate::derivatives::{
    DerivativeStrategy, Gradient2d, SecondOrder1d, SecondOrder2d, SpatialDerivatives,
};
use crate::error::{PhysicsError, Result, ensure_same_shape};
use crate::grid::{Grid1d, Grid2d};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use std::ops::Range;

/// 差分法による微分エンジン。
///
/// グリッドは形状と刻み幅の確認にだけ使い、座標値そのものは参照しません。
#[derive(Debug, Clone, Copy, Default)]
pub struct FiniteDifference;

fn full_ranges<const D: usize>(dims: [usize; D]) -> [Range<usize>; D] {
    dims.map(|d| 0..d)
}

fn check_axis<const D: usize>(dims: &[usize; D], axis: usize) -> Result<usize> {
    let n = dims[axis];
    if n < 3 {
        return Err(PhysicsError::InsufficientResolution {
            axis,
            len: n,
            required: 3,
        });
    }
    Ok(n)
}

/// 軸 `axis` に沿った一階中心差分 `(u[i+1] - u[i-1]) / (2h)`。
///
/// グリッドを必要としない版です。`h = 1.0` で単位間隔になります。
pub fn central_difference<B: Backend, const D: usize>(
    u: Tensor<B, D>,
    axis: usize,
    h: f64,
) -> Result<Tensor<B, D>> {
    let dims = u.dims();
    let n = check_axis(&dims, axis)?;

    let mut forward = full_ranges(dims);
    forward[axis] = 2..n;
    let mut backward = full_ranges(dims);
    backward[axis] = 0..n - 2;
    let mut inner = full_ranges(dims);
    inner[axis] = 1..n - 1;

    let stencil = (u.clone().slice(forward) - u.clone().slice(backward)).div_scalar(2.0 * h);
    Ok(Tensor::zeros(dims, &u.device()).slice_assign(inner, stencil))
}

/// 軸 `axis` に沿った二階中心差分 `(u[i+1] - 2u[i] + u[i-1]) / h²`。
pub fn second_difference<B: Backend, const D: usize>(
    u: Tensor<B, D>,
    axis: usize,
    h: f64,
) -> Result<Tensor<B, D>> {
    let dims = u.dims();
    let n = check_axis(&dims, axis)?;

    let mut forward = full_ranges(dims);
    forward[axis] = 2..n;
    let mut backward = full_ranges(dims);
    backward[axis] = 0..n - 2;
    let mut inner = full_ranges(dims);
    inner[axis] = 1..n - 1;

    let center = u.clone().slice(inner.clone()).mul_scalar(2.0);
    let stencil = (u.clone().slice(forward) - center + u.clone().slice(backward))
        .div_scalar(h * h);
    Ok(Tensor::zeros(dims, &u.device()).slice_assign(inner, stencil))
}

/// バッチ軸 (軸0) 以外の各軸から両端 `margin` セルずつ取り除きます。
///
/// 内点が 1 つも残らない軸があると `InsufficientResolution` を返します。
pub fn interior<B: Backend, const D: usize>(
    field: Tensor<B, D>,
    margin: usize,
) -> Result<Tensor<B, D>> {
    if margin == 0 {
        return Ok(field);
    }
    let dims = field.dims();
    let mut ranges = full_ranges(dims);
    for (axis, range) in ranges.iter_mut().enumerate().skip(1) {
        let n = dims[axis];
        if n <= 2 * margin {
            return Err(PhysicsError::InsufficientResolution {
                axis,
                len: n,
                required: 2 * margin + 1,
            });
        }
        *range = margin..n - margin;
    }
    Ok(field.slice(ranges))
}

impl FiniteDifference {
    fn check_grid(&self, strategy: DerivativeStrategy) -> Result<()> {
        if strategy != DerivativeStrategy::FiniteDifference {
            return Err(PhysicsError::StrategyMismatch {
                requested: DerivativeStrategy::FiniteDifference,
                grid: strategy,
            });
        }
        Ok(())
    }

    fn check_1d<B: Backend>(&self, u: &Tensor<B, 2>, grid: &Grid1d<B>) -> Result<()> {
        self.check_grid(grid.strategy())?;
        ensure_same_shape("field/grid", &grid.dims(), &u.dims())
    }

    fn check_2d<B: Backend>(&self, u: &Tensor<B, 3>, grid: &Grid2d<B>) -> Result<()> {
        self.check_grid(grid.strategy())?;
        ensure_same_shape("field/grid", &grid.dims(), &u.dims())
    }
}

impl<B: Backend> SpatialDerivatives<B> for FiniteDifference {
    type Field<const D: usize> = Tensor<B, D>;

    fn strategy(&self) -> DerivativeStrategy {
        DerivativeStrategy::FiniteDifference
    }

    fn unreliable_margin(&self, depth: usize) -> usize {
        depth
    }

    fn first_order_1d(&self, u: &Tensor<B, 2>, grid: &Grid1d<B>) -> Result<Tensor<B, 2>> {
        self.check_1d(u, grid)?;
        central_difference(u.clone(), 1, grid.dx())
    }

    fn second_order_1d(
        &self,
        u: &Tensor<B, 2>,
        grid: &Grid1d<B>,
    ) -> Result<SecondOrder1d<Tensor<B, 2>>> {
        self.check_1d(u, grid)?;
        Ok(SecondOrder1d {
            u_x: central_difference(u.clone(), 1, grid.dx())?,
            u_xx: second_difference(u.clone(), 1, grid.dx())?,
        })
    }

    fn first_order_2d(
        &self,
        u: &Tensor<B, 3>,
        grid: &Grid2d<B>,
    ) -> Result<Gradient2d<Tensor<B, 3>>> {
        self.check_2d(u, grid)?;
        Ok(Gradient2d {
            u_x: central_difference(u.clone(), 1, grid.dx())?,
            u_y: central_difference(u.clone(), 2, grid.dy())?,
        })
    }

    fn second_order_2d(
        &self,
        u: &Tensor<B, 3>,
        grid: &Grid2d<B>,
    ) -> Result<SecondOrder2d<Tensor<B, 3>>> {
        let Gradient2d { u_x, u_y } = self.first_order_2d(u, grid)?;
        tracing::debug!(dims = ?u.dims(), "finite-difference second derivatives");
        Ok(SecondOrder2d {
            u_x,
            u_y,
            u_xx: second_difference(u.clone(), 1, grid.dx())?,
            u_yy: second_difference(u.clone(), 2, grid.dy())?,
        })
    }

    fn divergence_2d(
        &self,
        f_x: &Tensor<B, 3>,
        f_y: &Tensor<B, 3>,
        grid: &Grid2d<B>,
    ) -> Result<Tensor<B, 3>> {
        self.check_2d(f_x, grid)?;
        self.check_2d(f_y, grid)?;
        let d_x = central_difference(f_x.clone(), 1, grid.dx())?;
        let d_y = central_difference(f_y.clone(), 2, grid.dy())?;
        Ok(d_x + d_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f64>;

    fn values<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f64> {
        t.to_data().iter::<f64>().collect()
    }

    #[test]
    fn unit_spacing_stencils_are_exact_for_quadratics() {
        let device = Default::default();
        // u = i^2 を単位間隔で並べたもの
        let u = Tensor::<TestBackend, 2>::from_floats([[0.0, 1.0, 4.0, 9.0, 16.0]], &device);

        let u_x = central_difference(u.clone(), 1, 1.0).unwrap();
        assert_eq!(values(u_x), vec![0.0, 2.0, 4.0, 6.0, 0.0]);

        let u_xx = second_difference(u, 1, 1.0).unwrap();
        assert_eq!(values(u_xx), vec![0.0, 2.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn axis_selection_in_2d() {
        let device = Default::default();
        // 軸1方向に 0, 1, 2 と増え、軸2方向には一定
        let u = Tensor::<TestBackend, 3>::from_floats(
            [[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0]]],
            &device,
        );
        let along_x = central_difference(u.clone(), 1, 1.0).unwrap();
        let along_y = central_difference(u, 2, 1.0).unwrap();
        assert_eq!(
            values(along_x),
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(values(along_y.abs()).iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn too_few_points() {
        let u = Tensor::<TestBackend, 2>::zeros([1, 2], &Default::default());
        assert_eq!(
            central_difference(u, 1, 1.0).unwrap_err(),
            PhysicsError::InsufficientResolution {
                axis: 1,
                len: 2,
                required: 3
            }
        );
    }

    #[test]
    fn interior_keeps_batch_axis() {
        let u = Tensor::<TestBackend, 3>::ones([2, 6, 5], &Default::default());
        assert_eq!(interior(u.clone(), 1).unwrap().dims(), [2, 4, 3]);
        assert_eq!(interior(u.clone(), 2).unwrap().dims(), [2, 2, 1]);
        assert_eq!(interior(u, 0).unwrap().dims(), [2, 6, 5]);
    }

    #[test]
    fn interior_rejects_axes_without_inner_points() {
        let u = Tensor::<TestBackend, 3>::ones([1, 4, 9], &Default::default());
        assert_eq!(
            interior(u.clone(), 2).unwrap_err(),
            PhysicsError::InsufficientResolution {
                axis: 1,
                len: 4,
                required: 5
            }
        );
        assert_eq!(interior(u, 1).unwrap().dims(), [1, 2, 7]);
    }

    #[test]
    fn boundary_cells_stay_zero() {
        let device = Default::default();
        let u = Tensor::<TestBackend, 2>::from_floats([[3.0, 1.0, 4.0, 1.0, 5.0]], &device);
        let u_xx = second_difference(u, 1, 0.5).unwrap();
        let v = values(u_xx);
        assert_eq!(v[0], 0.0);
        assert_eq!(v[4], 0.0);
        assert!((v[1] - (4.0 - 2.0 + 3.0) / 0.25).abs() < 1e-12);
        let total = Tensor::<TestBackend, 1>::from_floats(v.as_slice(), &device)
            .abs()
            .sum()
            .into_scalar()
            .elem::<f64>();
        assert!(total > 0.0);
    }
}
