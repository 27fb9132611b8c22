use crate::derivatives::DerivativeStrategy;
use thiserror::Error;

/// 残差・損失計算で発生するエラー。
///
/// いずれも呼び出し側の設定ミスを表すため、内部で再試行はせず `?` でそのまま伝播させます。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PhysicsError {
    /// 予測場・目標場・係数場・グリッドの形状が一致しない。
    #[error("形状が一致しません ({context}): 期待値 {expected:?}, 実際 {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// 微分戦略とグリッドの生成方法が食い違っている。
    #[error("{requested} の微分を {grid} 用のグリッドで要求しました")]
    StrategyMismatch {
        requested: DerivativeStrategy,
        grid: DerivativeStrategy,
    },

    /// 場が計算グラフを持たず、自動微分の経路が存在しない。
    #[error("場が計算グラフを持たないため座標 {axis} で微分できません")]
    DetachedField { axis: &'static str },

    /// 相対ノルム損失の分母 (目標場のノルム) がゼロ。
    #[error(
        "目標場のノルムがゼロです (サンプル {sample}, チャネル {channel:?}, ノルム {norm:e})"
    )]
    DivisionByZeroNorm {
        sample: usize,
        channel: Option<usize>,
        norm: f64,
    },

    /// 実装されていない空間次元。
    #[error("{dim} 次元の問題には対応していません")]
    UnsupportedProblemDimension { dim: usize },

    /// 差分ステンシルに対して格子点が少なすぎる。
    #[error("軸 {axis} の格子点数 {len} は少なすぎます (最低 {required})")]
    InsufficientResolution {
        axis: usize,
        len: usize,
        required: usize,
    },

    /// 相対 Lp 損失で p ∈ {1, 2} 以外が指定された。
    #[error("L^{p} ノルムには対応していません (p = 1, 2 のみ)")]
    UnsupportedNorm { p: u32 },
}

pub type Result<T> = std::result::Result<T, PhysicsError>;

/// 2つの形状が一致することを確認します。
pub(crate) fn ensure_same_shape(
    context: &'static str,
    expected: &[usize],
    found: &[usize],
) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(PhysicsError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_shape_passes() {
        assert!(ensure_same_shape("test", &[1, 2, 3], &[1, 2, 3]).is_ok());
    }

    #[test]
    fn different_shape_reports_both_sides() {
        let err = ensure_same_shape("pred/target", &[2, 4], &[2, 5]).unwrap_err();
        assert_eq!(
            err,
            PhysicsError::ShapeMismatch {
                context: "pred/target",
                expected: vec![2, 4],
                found: vec![2, 5],
            }
        );
    }

    #[test]
    fn strategy_mismatch_message_names_both_strategies() {
        let err = PhysicsError::StrategyMismatch {
            requested: DerivativeStrategy::FiniteDifference,
            grid: DerivativeStrategy::Autograd,
        };
        let msg = err.to_string();
        assert!(msg.contains("finite-difference"));
        assert!(msg.contains("autograd"));
    }
}
