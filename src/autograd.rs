//! 高階微分に対応した逆伝播モードの自動微分。
//!
//! `burn` のテンソルを値として保持し、演算ごとに計算グラフのノードを作ります。
//! 勾配そのものも `Var` の演算で組み立てるため (create-graph)、
//! 一階微分をもう一度微分して二階微分を得ることができます。

use crate::derivatives::{
    DerivativeStrategy, Gradient2d, SecondOrder1d, SecondOrder2d, SpatialDerivatives,
};
use crate::error::{PhysicsError, Result, ensure_same_shape};
use crate::grid::{Grid1d, Grid2d};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
enum Op<B: Backend, const D: usize> {
    Leaf,
    Add(Var<B, D>, Var<B, D>),
    Sub(Var<B, D>, Var<B, D>),
    Mul(Var<B, D>, Var<B, D>),
    Neg(Var<B, D>),
    Scale(Var<B, D>, f64),
    Shift(Var<B, D>),
    Powi(Var<B, D>, i32),
    Sin(Var<B, D>),
    Cos(Var<B, D>),
    Exp(Var<B, D>),
}

#[derive(Debug)]
struct Node<B: Backend, const D: usize> {
    id: u64,
    value: Tensor<B, D>,
    op: Op<B, D>,
    requires_grad: bool,
}

/// 計算グラフ上の値。
///
/// クローンは同じノードを指します。
#[derive(Debug)]
pub struct Var<B: Backend, const D: usize> {
    node: Arc<Node<B, D>>,
}

impl<B: Backend, const D: usize> Clone for Var<B, D> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<B: Backend, const D: usize> Var<B, D> {
    fn from_op(value: Tensor<B, D>, op: Op<B, D>, requires_grad: bool) -> Self {
        Self {
            node: Arc::new(Node {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                value,
                op,
                requires_grad,
            }),
        }
    }

    /// 勾配を追跡する葉ノード (座標など) を作ります。
    pub fn leaf(value: Tensor<B, D>) -> Self {
        Self::from_op(value, Op::Leaf, true)
    }

    /// 勾配を追跡しない定数を作ります。
    pub fn constant(value: Tensor<B, D>) -> Self {
        Self::from_op(value, Op::Leaf, false)
    }

    pub fn value(&self) -> Tensor<B, D> {
        self.node.value.clone()
    }

    pub fn dims(&self) -> [usize; D] {
        self.node.value.dims()
    }

    pub fn requires_grad(&self) -> bool {
        self.node.requires_grad
    }

    fn id(&self) -> u64 {
        self.node.id
    }

    fn unary(&self, value: Tensor<B, D>, op: Op<B, D>) -> Self {
        Self::from_op(value, op, self.requires_grad())
    }

    fn binary(&self, other: &Self, value: Tensor<B, D>, op: Op<B, D>) -> Self {
        let requires_grad = self.requires_grad() || other.requires_grad();
        Self::from_op(value, op, requires_grad)
    }

    pub fn add(&self, other: &Self) -> Self {
        let value = self.value() + other.value();
        self.binary(other, value, Op::Add(self.clone(), other.clone()))
    }

    pub fn sub(&self, other: &Self) -> Self {
        let value = self.value() - other.value();
        self.binary(other, value, Op::Sub(self.clone(), other.clone()))
    }

    pub fn mul(&self, other: &Self) -> Self {
        let value = self.value() * other.value();
        self.binary(other, value, Op::Mul(self.clone(), other.clone()))
    }

    pub fn neg(&self) -> Self {
        self.unary(self.value().neg(), Op::Neg(self.clone()))
    }

    pub fn mul_scalar(&self, scalar: f64) -> Self {
        self.unary(self.value().mul_scalar(scalar), Op::Scale(self.clone(), scalar))
    }

    pub fn add_scalar(&self, scalar: f64) -> Self {
        self.unary(self.value().add_scalar(scalar), Op::Shift(self.clone()))
    }

    /// 整数乗。指数が 0 のときは 1 の定数になります。
    pub fn powi(&self, exponent: i32) -> Self {
        if exponent == 0 {
            return Self::constant(Tensor::ones_like(&self.node.value));
        }
        let mut value = self.value();
        for _ in 1..exponent.unsigned_abs() {
            value = value * self.value();
        }
        if exponent < 0 {
            value = value.recip();
        }
        self.unary(value, Op::Powi(self.clone(), exponent))
    }

    pub fn sin(&self) -> Self {
        self.unary(self.value().sin(), Op::Sin(self.clone()))
    }

    pub fn cos(&self) -> Self {
        self.unary(self.value().cos(), Op::Cos(self.clone()))
    }

    pub fn exp(&self) -> Self {
        self.unary(self.value().exp(), Op::Exp(self.clone()))
    }

    /// 勾配を追跡するノードを出力側から見てトポロジカル順に並べます (出力が末尾)。
    fn topological_order(&self) -> Vec<Var<B, D>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((var, expanded)) = stack.pop() {
            if expanded {
                order.push(var);
                continue;
            }
            if !var.requires_grad() || !visited.insert(var.id()) {
                continue;
            }
            stack.push((var.clone(), true));
            for parent in var.parents() {
                if parent.requires_grad() && !visited.contains(&parent.id()) {
                    stack.push((parent.clone(), false));
                }
            }
        }
        order
    }

    fn parents(&self) -> Vec<&Var<B, D>> {
        match &self.node.op {
            Op::Leaf => vec![],
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) => vec![a, b],
            Op::Neg(a)
            | Op::Scale(a, _)
            | Op::Shift(a)
            | Op::Powi(a, _)
            | Op::Sin(a)
            | Op::Cos(a)
            | Op::Exp(a) => vec![a],
        }
    }

    /// `self` の全要素の和を `wrt` で微分します。
    ///
    /// 勾配は `Var` として組み立てられるので、結果をさらに微分できます。
    /// `wrt` が勾配を追跡していない、または `self` が `wrt` に依存しない場合は `None`。
    pub fn grad(&self, wrt: &Var<B, D>) -> Option<Var<B, D>> {
        if !wrt.requires_grad() || !self.requires_grad() {
            return None;
        }
        let order = self.topological_order();
        let mut grads: HashMap<u64, Var<B, D>> = HashMap::new();
        grads.insert(
            self.id(),
            Var::constant(Tensor::ones_like(&self.node.value)),
        );

        for var in order.iter().rev() {
            let Some(g) = grads.get(&var.id()).cloned() else {
                continue;
            };
            match &var.node.op {
                Op::Leaf => {}
                Op::Add(a, b) => {
                    accumulate(&mut grads, a, g.clone());
                    accumulate(&mut grads, b, g);
                }
                Op::Sub(a, b) => {
                    accumulate(&mut grads, a, g.clone());
                    accumulate(&mut grads, b, g.neg());
                }
                Op::Mul(a, b) => {
                    accumulate(&mut grads, a, g.mul(b));
                    accumulate(&mut grads, b, g.mul(a));
                }
                Op::Neg(a) => accumulate(&mut grads, a, g.neg()),
                Op::Scale(a, s) => accumulate(&mut grads, a, g.mul_scalar(*s)),
                Op::Shift(a) => accumulate(&mut grads, a, g),
                Op::Powi(a, n) => {
                    let local = a.powi(n - 1).mul_scalar(*n as f64);
                    accumulate(&mut grads, a, g.mul(&local));
                }
                Op::Sin(a) => accumulate(&mut grads, a, g.mul(&a.cos())),
                Op::Cos(a) => accumulate(&mut grads, a, g.mul(&a.sin().neg())),
                Op::Exp(a) => accumulate(&mut grads, a, g.mul(var)),
            }
        }

        grads.remove(&wrt.id())
    }
}

fn accumulate<B: Backend, const D: usize>(
    grads: &mut HashMap<u64, Var<B, D>>,
    target: &Var<B, D>,
    grad: Var<B, D>,
) {
    if !target.requires_grad() {
        return;
    }
    let merged = match grads.remove(&target.id()) {
        Some(existing) => existing.add(&grad),
        None => grad,
    };
    grads.insert(target.id(), merged);
}

/// 自動微分による微分エンジン。
///
/// 各点の値はその点の座標だけに依存すると仮定し、`sum(u)` を座標で微分した結果を
/// 点ごとの偏微分として扱います。
///
/// 場は [`Var`] の演算でグリッド座標から組み立てたものに限ります。burn の
/// `Autodiff` バックエンドの出力 (学習中のモデルの予測など) は微分できないので、
/// 学習時の物理損失には [`crate::ResidualLoss`] (差分法) を使います。
#[derive(Debug, Clone, Copy, Default)]
pub struct Autograd;

impl Autograd {
    fn check_grid(&self, strategy: DerivativeStrategy) -> Result<()> {
        if strategy != DerivativeStrategy::Autograd {
            return Err(PhysicsError::StrategyMismatch {
                requested: DerivativeStrategy::Autograd,
                grid: strategy,
            });
        }
        Ok(())
    }

    /// 入力の場が計算グラフを持っているか確認します。
    fn check_tracked<B: Backend, const D: usize>(
        &self,
        u: &Var<B, D>,
        axis: &'static str,
    ) -> Result<()> {
        if u.requires_grad() {
            Ok(())
        } else {
            Err(PhysicsError::DetachedField { axis })
        }
    }

    /// 座標に依存しない項の微分は 0 とします。
    fn partial<B: Backend, const D: usize>(
        &self,
        u: &Var<B, D>,
        coordinate: &Var<B, D>,
    ) -> Var<B, D> {
        u.grad(coordinate)
            .unwrap_or_else(|| Var::constant(Tensor::zeros_like(&u.value())))
    }
}

impl<B: Backend> SpatialDerivatives<B> for Autograd {
    type Field<const D: usize> = Var<B, D>;

    fn strategy(&self) -> DerivativeStrategy {
        DerivativeStrategy::Autograd
    }

    fn unreliable_margin(&self, _depth: usize) -> usize {
        0
    }

    fn first_order_1d(&self, u: &Var<B, 2>, grid: &Grid1d<B>) -> Result<Var<B, 2>> {
        self.check_grid(grid.strategy())?;
        ensure_same_shape("field/grid", &grid.dims(), &u.dims())?;
        self.check_tracked(u, "x")?;
        Ok(self.partial(u, &grid.x()))
    }

    fn second_order_1d(
        &self,
        u: &Var<B, 2>,
        grid: &Grid1d<B>,
    ) -> Result<SecondOrder1d<Var<B, 2>>> {
        let u_x = self.first_order_1d(u, grid)?;
        let u_xx = self.partial(&u_x, &grid.x());
        Ok(SecondOrder1d { u_x, u_xx })
    }

    fn first_order_2d(&self, u: &Var<B, 3>, grid: &Grid2d<B>) -> Result<Gradient2d<Var<B, 3>>> {
        self.check_grid(grid.strategy())?;
        ensure_same_shape("field/grid", &grid.dims(), &u.dims())?;
        self.check_tracked(u, "x, y")?;
        Ok(Gradient2d {
            u_x: self.partial(u, &grid.x()),
            u_y: self.partial(u, &grid.y()),
        })
    }

    fn second_order_2d(
        &self,
        u: &Var<B, 3>,
        grid: &Grid2d<B>,
    ) -> Result<SecondOrder2d<Var<B, 3>>> {
        let Gradient2d { u_x, u_y } = self.first_order_2d(u, grid)?;
        tracing::debug!(dims = ?u.dims(), "autograd second derivatives");
        let u_xx = self.partial(&u_x, &grid.x());
        let u_yy = self.partial(&u_y, &grid.y());
        Ok(SecondOrder2d {
            u_x,
            u_y,
            u_xx,
            u_yy,
        })
    }

    fn divergence_2d(
        &self,
        f_x: &Var<B, 3>,
        f_y: &Var<B, 3>,
        grid: &Grid2d<B>,
    ) -> Result<Var<B, 3>> {
        self.check_grid(grid.strategy())?;
        ensure_same_shape("flux/grid", &grid.dims(), &f_x.dims())?;
        ensure_same_shape("flux/grid", &grid.dims(), &f_y.dims())?;
        let d_x = self.partial(f_x, &grid.x());
        let d_y = self.partial(f_y, &grid.y());
        Ok(d_x.add(&d_y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f64>;

    fn max_abs_diff(a: Tensor<TestBackend, 1>, b: Tensor<TestBackend, 1>) -> f64 {
        (a - b).abs().max().into_scalar().elem::<f64>()
    }

    fn points() -> Var<TestBackend, 1> {
        let device = Default::default();
        Var::leaf(Tensor::from_floats([-1.0, -0.5, 0.0, 0.25, 2.0], &device))
    }

    #[test]
    fn product_rule_and_second_derivative() {
        let x = points();
        // u = x^3 + 2x
        let u = x.mul(&x).mul(&x).add(&x.mul_scalar(2.0));
        let u_x = u.grad(&x).unwrap();
        let u_xx = u_x.grad(&x).unwrap();

        let xv = x.value();
        let expected_u_x = xv.clone().powf_scalar(2.0).mul_scalar(3.0).add_scalar(2.0);
        let expected_u_xx = xv.mul_scalar(6.0);
        assert!(max_abs_diff(u_x.value(), expected_u_x) < 1e-12);
        assert!(max_abs_diff(u_xx.value(), expected_u_xx) < 1e-12);
    }

    #[test]
    fn trigonometric_and_exponential_chain() {
        let x = points();
        let u = x.sin().mul(&x.exp());
        let u_x = u.grad(&x).unwrap();

        let xv = x.value();
        let expected = (xv.clone().cos() + xv.clone().sin()) * xv.exp();
        assert!(max_abs_diff(u_x.value(), expected) < 1e-12);
    }

    #[test]
    fn cos_second_derivative_is_negative_cos() {
        let x = points();
        let u = x.cos();
        let u_xx = u.grad(&x).unwrap().grad(&x).unwrap();
        assert!(max_abs_diff(u_xx.value(), x.value().cos().neg()) < 1e-12);
    }

    #[test]
    fn integer_powers_including_negative() {
        let x = Var::<TestBackend, 1>::leaf(Tensor::from_floats(
            [0.5, 1.0, 2.0],
            &Default::default(),
        ));
        let u = x.powi(-2);
        let u_x = u.grad(&x).unwrap();
        let expected = x.value().powf_scalar(-3.0).mul_scalar(-2.0);
        assert!(max_abs_diff(u_x.value(), expected) < 1e-12);

        let one = x.powi(0);
        assert!(!one.requires_grad());
    }

    #[test]
    fn constants_have_no_gradient_path() {
        let x = points();
        let c = Var::constant(x.value());
        let u = c.mul(&c);
        assert!(u.grad(&x).is_none());
        assert!(x.mul(&x).grad(&c).is_none());
    }

    #[test]
    fn shared_subexpressions_accumulate() {
        let x = points();
        let s = x.add_scalar(1.0);
        // u = (x + 1)^2 + x
        let u = s.mul(&s).sub(&x.neg());
        let u_x = u.grad(&x).unwrap();
        let expected = x.value().add_scalar(1.0).mul_scalar(2.0).add_scalar(1.0);
        assert!(max_abs_diff(u_x.value(), expected) < 1e-12);
    }
}
