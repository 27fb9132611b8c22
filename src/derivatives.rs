//! 空間微分の共通インターフェース。
//!
//! 自動微分 ([`Autograd`](crate::Autograd)) と差分法
//! ([`FiniteDifference`](crate::FiniteDifference)) は同じトレイトを実装し、
//! 残差計算はどちらの戦略にも依存しない形で書かれます。

use crate::autograd::Var;
use crate::error::Result;
use crate::grid::{Grid1d, Grid2d};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use std::fmt;

/// 空間微分の計算方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum DerivativeStrategy {
    /// 計算グラフを逆にたどる厳密な微分
    Autograd,
    /// 中心差分による近似
    FiniteDifference,
}

impl fmt::Display for DerivativeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivativeStrategy::Autograd => f.write_str("autograd"),
            DerivativeStrategy::FiniteDifference => f.write_str("finite-difference"),
        }
    }
}

/// 微分・残差計算で扱う場の最小限の演算。
///
/// 差分法では `Tensor`、自動微分では計算グラフを保持した [`Var`] が実装します。
pub trait FieldOps<B: Backend, const D: usize>: Clone {
    /// 勾配を追跡しない定数として場を作ります。
    fn constant(tensor: Tensor<B, D>) -> Self;
    fn value(&self) -> Tensor<B, D>;
    fn plus(&self, other: &Self) -> Self;
    fn minus(&self, other: &Self) -> Self;
    fn times(&self, other: &Self) -> Self;
    fn scale(&self, factor: f64) -> Self;

    fn dims(&self) -> [usize; D] {
        self.value().dims()
    }
}

impl<B: Backend, const D: usize> FieldOps<B, D> for Tensor<B, D> {
    fn constant(tensor: Tensor<B, D>) -> Self {
        tensor
    }

    fn value(&self) -> Tensor<B, D> {
        self.clone()
    }

    fn plus(&self, other: &Self) -> Self {
        self.clone().add(other.clone())
    }

    fn minus(&self, other: &Self) -> Self {
        self.clone().sub(other.clone())
    }

    fn times(&self, other: &Self) -> Self {
        self.clone().mul(other.clone())
    }

    fn scale(&self, factor: f64) -> Self {
        self.clone().mul_scalar(factor)
    }
}

impl<B: Backend, const D: usize> FieldOps<B, D> for Var<B, D> {
    fn constant(tensor: Tensor<B, D>) -> Self {
        Var::constant(tensor)
    }

    fn value(&self) -> Tensor<B, D> {
        Var::value(self)
    }

    fn plus(&self, other: &Self) -> Self {
        self.add(other)
    }

    fn minus(&self, other: &Self) -> Self {
        self.sub(other)
    }

    fn times(&self, other: &Self) -> Self {
        self.mul(other)
    }

    fn scale(&self, factor: f64) -> Self {
        self.mul_scalar(factor)
    }
}

/// 1次元の二階微分の結果。
#[derive(Debug, Clone)]
pub struct SecondOrder1d<F> {
    pub u_x: F,
    pub u_xx: F,
}

/// 2次元の勾配。
#[derive(Debug, Clone)]
pub struct Gradient2d<F> {
    pub u_x: F,
    pub u_y: F,
}

/// 2次元の一階・二階微分 (混合微分は含みません)。
#[derive(Debug, Clone)]
pub struct SecondOrder2d<F> {
    pub u_x: F,
    pub u_y: F,
    pub u_xx: F,
    pub u_yy: F,
}

/// 場の空間微分を計算する戦略。
///
/// 1次元の場は `(batch, n)`、2次元の場は `(batch, nx, ny)` の形状を持ち、
/// 結果は入力と同じ形状になります。
pub trait SpatialDerivatives<B: Backend> {
    /// この戦略が扱う場の型。
    type Field<const D: usize>: FieldOps<B, D>;

    fn strategy(&self) -> DerivativeStrategy;

    /// 深さ `depth` のステンシルを重ねたとき、境界から何セル分の値が信用できないか。
    fn unreliable_margin(&self, depth: usize) -> usize;

    fn first_order_1d(&self, u: &Self::Field<2>, grid: &Grid1d<B>) -> Result<Self::Field<2>>;

    fn second_order_1d(
        &self,
        u: &Self::Field<2>,
        grid: &Grid1d<B>,
    ) -> Result<SecondOrder1d<Self::Field<2>>>;

    fn first_order_2d(
        &self,
        u: &Self::Field<3>,
        grid: &Grid2d<B>,
    ) -> Result<Gradient2d<Self::Field<3>>>;

    fn second_order_2d(
        &self,
        u: &Self::Field<3>,
        grid: &Grid2d<B>,
    ) -> Result<SecondOrder2d<Self::Field<3>>>;

    /// ベクトル場 `(f_x, f_y)` の発散 `∂f_x/∂x + ∂f_y/∂y`。
    fn divergence_2d(
        &self,
        f_x: &Self::Field<3>,
        f_y: &Self::Field<3>,
        grid: &Grid2d<B>,
    ) -> Result<Self::Field<3>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f64>;

    #[test]
    fn tensor_and_var_fields_agree() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0], &device);
        let b = Tensor::<TestBackend, 1>::from_floats([0.5, -1.0, 4.0], &device);

        let t = a.plus(&b).times(&a).minus(&b).scale(2.0);
        let va = <Var<TestBackend, 1> as FieldOps<TestBackend, 1>>::constant(a);
        let vb = Var::constant(b);
        let v = va.plus(&vb).times(&va).minus(&vb).scale(2.0);

        let diff = (t - FieldOps::value(&v)).abs().max().into_scalar().elem::<f64>();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn strategy_display_names() {
        assert_eq!(DerivativeStrategy::Autograd.to_string(), "autograd");
        assert_eq!(
            DerivativeStrategy::FiniteDifference.to_string(),
            "finite-difference"
        );
    }
}
