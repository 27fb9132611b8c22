//! PDE 残差。
//!
//! どの残差も微分エンジンを引数に取り、自動微分・差分法の両方で同じ式を評価します。
//! 差分法の場合、境界から [`Residual::unreliable_margin`] セル以内の値は使えません。

use crate::derivatives::{FieldOps, SpatialDerivatives};
use crate::error::{Result, ensure_same_shape};
use crate::grid::Grid;
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 予測場から点ごとの PDE 残差を計算します。
pub trait Residual<B: Backend> {
    /// 呼び出しごとに与える追加の入力 (右辺・係数場・波数など)。
    type Input;

    /// 差分ステンシルを何段重ねるか。
    fn stencil_depth(&self) -> usize;

    /// `u` と同じ形状の残差を返します。2次元のグリッドのみ対応します。
    fn evaluate<S: SpatialDerivatives<B>>(
        &self,
        engine: &S,
        u: &S::Field<3>,
        grid: &Grid<B>,
        input: &Self::Input,
    ) -> Result<S::Field<3>>;

    /// 差分法で信用できない境界セルの幅。
    fn unreliable_margin<S: SpatialDerivatives<B>>(&self, engine: &S) -> usize {
        engine.unreliable_margin(self.stencil_depth())
    }
}

/// ポアソン方程式: `Δu - rhs`。
#[derive(Debug, Clone, Copy, Default)]
pub struct PoissonResidual;

impl PoissonResidual {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Residual<B> for PoissonResidual {
    /// 右辺 `rhs`
    type Input = Tensor<B, 3>;

    fn stencil_depth(&self) -> usize {
        1
    }

    fn evaluate<S: SpatialDerivatives<B>>(
        &self,
        engine: &S,
        u: &S::Field<3>,
        grid: &Grid<B>,
        rhs: &Tensor<B, 3>,
    ) -> Result<S::Field<3>> {
        let grid = grid.as_2d()?;
        ensure_same_shape("rhs/field", &u.dims(), &rhs.dims())?;
        let d = engine.second_order_2d(u, grid)?;
        let laplacian = d.u_xx.plus(&d.u_yy);
        Ok(laplacian.minus(&<S::Field<3> as FieldOps<B, 3>>::constant(rhs.clone())))
    }
}

/// ダルシー流れ: `div(a ∇u) + rhs`。
///
/// 右辺は構築時に固定し、係数場 `a` を呼び出しごとに与えます。
#[derive(Debug, Clone)]
pub struct DarcyResidual<B: Backend> {
    rhs: Tensor<B, 3>,
}

impl<B: Backend> DarcyResidual<B> {
    /// `rhs` のバッチ次元が 1 の場合は呼び出し時のバッチに合わせて複製します。
    pub fn new(rhs: Tensor<B, 3>) -> Self {
        Self { rhs }
    }

    fn rhs_for(&self, dims: [usize; 3]) -> Result<Tensor<B, 3>> {
        let [batch, nx, ny] = self.rhs.dims();
        if batch == 1 && dims[0] != 1 && [nx, ny] == [dims[1], dims[2]] {
            return Ok(self.rhs.clone().repeat_dim(0, dims[0]));
        }
        ensure_same_shape("rhs/field", &dims, &self.rhs.dims())?;
        Ok(self.rhs.clone())
    }
}

impl<B: Backend> Residual<B> for DarcyResidual<B> {
    /// 係数場 `a`
    type Input = Tensor<B, 3>;

    fn stencil_depth(&self) -> usize {
        2
    }

    fn evaluate<S: SpatialDerivatives<B>>(
        &self,
        engine: &S,
        u: &S::Field<3>,
        grid: &Grid<B>,
        a: &Tensor<B, 3>,
    ) -> Result<S::Field<3>> {
        let grid = grid.as_2d()?;
        let dims = u.dims();
        ensure_same_shape("coefficient/field", &dims, &a.dims())?;
        let rhs = self.rhs_for(dims)?;

        let a = <S::Field<3> as FieldOps<B, 3>>::constant(a.clone());
        let grad = engine.first_order_2d(u, grid)?;
        let flux_x = a.times(&grad.u_x);
        let flux_y = a.times(&grad.u_y);
        let divergence = engine.divergence_2d(&flux_x, &flux_y, grid)?;
        tracing::debug!(?dims, strategy = %engine.strategy(), "darcy residual");
        Ok(divergence.plus(&<S::Field<3> as FieldOps<B, 3>>::constant(rhs)))
    }
}

/// ヘルムホルツ方程式: `Δu + k² u`。
#[derive(Debug, Clone, Copy, Default)]
pub struct HelmholtzResidual;

impl HelmholtzResidual {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Residual<B> for HelmholtzResidual {
    /// 波数 `k`
    type Input = f64;

    fn stencil_depth(&self) -> usize {
        1
    }

    fn evaluate<S: SpatialDerivatives<B>>(
        &self,
        engine: &S,
        u: &S::Field<3>,
        grid: &Grid<B>,
        k: &f64,
    ) -> Result<S::Field<3>> {
        let grid = grid.as_2d()?;
        let d = engine.second_order_2d(u, grid)?;
        let laplacian = d.u_xx.plus(&d.u_yy);
        Ok(laplacian.plus(&u.scale(k * k)))
    }
}
