use crate::autograd::Var;
use crate::derivatives::DerivativeStrategy;
use crate::error::{PhysicsError, Result as PhysicsResult};
use burn::config::Config;
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};

/// 座標グリッドの定義域。
#[derive(Config, Debug)]
pub struct GridConfig {
    /// 各軸の下端
    #[config(default = 0.0)]
    pub lower: f64,
    /// 各軸の上端
    #[config(default = 1.0)]
    pub upper: f64,
}

/// 1次元グリッド。座標 `x` の形状は `(batch, n)`。
#[derive(Debug, Clone)]
pub struct Grid1d<B: Backend> {
    x: Var<B, 2>,
    dx: f64,
    strategy: DerivativeStrategy,
}

impl<B: Backend> Grid1d<B> {
    pub fn x(&self) -> Var<B, 2> {
        self.x.clone()
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    pub fn strategy(&self) -> DerivativeStrategy {
        self.strategy
    }

    pub fn dims(&self) -> [usize; 2] {
        self.x.dims()
    }
}

/// 2次元グリッド。座標 `X`, `Y` の形状は `(batch, nx, ny)` で、
/// `X` は軸1、`Y` は軸2に沿って変化します。
#[derive(Debug, Clone)]
pub struct Grid2d<B: Backend> {
    x: Var<B, 3>,
    y: Var<B, 3>,
    dx: f64,
    dy: f64,
    strategy: DerivativeStrategy,
}

impl<B: Backend> Grid2d<B> {
    pub fn x(&self) -> Var<B, 3> {
        self.x.clone()
    }

    pub fn y(&self) -> Var<B, 3> {
        self.y.clone()
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    pub fn dy(&self) -> f64 {
        self.dy
    }

    pub fn strategy(&self) -> DerivativeStrategy {
        self.strategy
    }

    pub fn dims(&self) -> [usize; 3] {
        self.x.dims()
    }
}

/// 次元を実行時に決めるグリッド。
#[derive(Debug, Clone)]
pub enum Grid<B: Backend> {
    OneD(Grid1d<B>),
    TwoD(Grid2d<B>),
}

impl<B: Backend> Grid<B> {
    pub fn problem_dim(&self) -> usize {
        match self {
            Grid::OneD(_) => 1,
            Grid::TwoD(_) => 2,
        }
    }

    pub fn as_1d(&self) -> PhysicsResult<&Grid1d<B>> {
        match self {
            Grid::OneD(grid) => Ok(grid),
            Grid::TwoD(_) => Err(PhysicsError::UnsupportedProblemDimension { dim: 2 }),
        }
    }

    pub fn as_2d(&self) -> PhysicsResult<&Grid2d<B>> {
        match self {
            Grid::TwoD(grid) => Ok(grid),
            Grid::OneD(_) => Err(PhysicsError::UnsupportedProblemDimension { dim: 1 }),
        }
    }
}

impl<B: Backend> From<Grid1d<B>> for Grid<B> {
    fn from(grid: Grid1d<B>) -> Self {
        Grid::OneD(grid)
    }
}

impl<B: Backend> From<Grid2d<B>> for Grid<B> {
    fn from(grid: Grid2d<B>) -> Self {
        Grid::TwoD(grid)
    }
}

/// 微分戦略に合わせた座標グリッドを生成します。
///
/// 自動微分用のグリッドは勾配を追跡する葉ノード、差分法用のグリッドは定数になります。
#[derive(Debug, Clone)]
pub struct GridFactory<B: Backend> {
    config: GridConfig,
    strategy: DerivativeStrategy,
    device: B::Device,
}

impl<B: Backend> GridFactory<B> {
    pub fn new(config: GridConfig, strategy: DerivativeStrategy, device: &B::Device) -> Self {
        Self {
            config,
            strategy,
            device: device.clone(),
        }
    }

    pub fn strategy(&self) -> DerivativeStrategy {
        self.strategy
    }

    /// `[batch, n]` なら1次元、`[batch, nx, ny]` なら2次元のグリッドを作ります。
    pub fn grid(&self, shape: &[usize]) -> PhysicsResult<Grid<B>> {
        match *shape {
            [batch, n] => Ok(self.grid_1d(batch, n)?.into()),
            [batch, nx, ny] => Ok(self.grid_2d(batch, nx, ny)?.into()),
            _ => Err(PhysicsError::UnsupportedProblemDimension {
                dim: shape.len().saturating_sub(1),
            }),
        }
    }

    pub fn grid_1d(&self, batch: usize, n: usize) -> PhysicsResult<Grid1d<B>> {
        let (points, dx) = self.axis(1, n)?;
        let values = (0..batch)
            .flat_map(|_| points.iter().copied())
            .collect::<Vec<f64>>();
        let x = self.coordinate(values, [batch, n]);
        Ok(Grid1d {
            x,
            dx,
            strategy: self.strategy,
        })
    }

    pub fn grid_2d(&self, batch: usize, nx: usize, ny: usize) -> PhysicsResult<Grid2d<B>> {
        let (xs, dx) = self.axis(1, nx)?;
        let (ys, dy) = self.axis(2, ny)?;
        let mut x_values = Vec::with_capacity(batch * nx * ny);
        let mut y_values = Vec::with_capacity(batch * nx * ny);
        for _ in 0..batch {
            for x in &xs {
                for y in &ys {
                    x_values.push(*x);
                    y_values.push(*y);
                }
            }
        }
        Ok(Grid2d {
            x: self.coordinate(x_values, [batch, nx, ny]),
            y: self.coordinate(y_values, [batch, nx, ny]),
            dx,
            dy,
            strategy: self.strategy,
        })
    }

    /// 等間隔の点列と刻み幅を返します。
    fn axis(&self, axis: usize, n: usize) -> PhysicsResult<(Vec<f64>, f64)> {
        if n < 2 {
            return Err(PhysicsError::InsufficientResolution {
                axis,
                len: n,
                required: 2,
            });
        }
        let h = (self.config.upper - self.config.lower) / (n - 1) as f64;
        let points = (0..n)
            .map(|i| self.config.lower + i as f64 * h)
            .collect::<Vec<f64>>();
        Ok((points, h))
    }

    fn coordinate<const D: usize>(&self, values: Vec<f64>, shape: [usize; D]) -> Var<B, D> {
        let data = TensorData::new(values, shape).convert::<B::FloatElem>();
        let tensor = Tensor::<B, D>::from_data(data, &self.device);
        match self.strategy {
            DerivativeStrategy::Autograd => Var::leaf(tensor),
            DerivativeStrategy::FiniteDifference => Var::constant(tensor),
        }
    }
}
