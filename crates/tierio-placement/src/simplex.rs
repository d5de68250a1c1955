//! Dense two-phase simplex solver
//!
//! Small linear programs only: the tableau is a dense `Vec<Vec<f64>>` and
//! pivots follow Bland's rule, which cannot cycle. Phase one drives the
//! artificial variables to zero; phase two optimizes the real objective with
//! artificial columns barred from re-entering the basis.

use thiserror::Error;

const EPS: f64 = 1e-9;
const MAX_PIVOTS: usize = 50_000;

/// Sense of a constraint row
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    LessEq,
    Equal,
    GreaterEq,
}

/// One row `coeffs · x (relation) rhs`
#[derive(Clone, Debug)]
pub struct Constraint {
    pub coeffs: Vec<f64>,
    pub relation: Relation,
    pub rhs: f64,
}

/// Why a program has no optimum
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LpError {
    #[error("linear program is infeasible")]
    Infeasible,
    #[error("linear program is unbounded")]
    Unbounded,
    #[error("simplex did not converge within {0} pivots")]
    IterationLimit(usize),
}

/// Minimize `objective · x` subject to the constraints and `x >= 0`
#[derive(Clone, Debug)]
pub struct LinearProgram {
    num_vars: usize,
    objective: Vec<f64>,
    constraints: Vec<Constraint>,
}

impl LinearProgram {
    #[must_use]
    pub fn new(objective: Vec<f64>) -> Self {
        Self {
            num_vars: objective.len(),
            objective,
            constraints: Vec::new(),
        }
    }

    #[must_use]
    pub const fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Add a row; missing trailing coefficients are zero
    pub fn constrain(&mut self, mut coeffs: Vec<f64>, relation: Relation, rhs: f64) {
        coeffs.resize(self.num_vars, 0.0);
        self.constraints.push(Constraint { coeffs, relation, rhs });
    }

    /// Solve; returns the optimal `x`
    pub fn minimize(&self) -> Result<Vec<f64>, LpError> {
        Tableau::build(self).solve(&self.objective)
    }
}

struct Tableau {
    rows: Vec<Vec<f64>>,
    basis: Vec<usize>,
    num_vars: usize,
    first_artificial: usize,
    width: usize,
}

impl Tableau {
    fn build(lp: &LinearProgram) -> Self {
        let m = lp.constraints.len();
        let slacks = lp
            .constraints
            .iter()
            .filter(|c| c.relation != Relation::Equal)
            .count();
        let artificials = lp
            .constraints
            .iter()
            .filter(|c| {
                let flipped = c.rhs < 0.0;
                match c.relation {
                    Relation::LessEq => flipped,
                    Relation::GreaterEq => !flipped,
                    Relation::Equal => true,
                }
            })
            .count();

        let first_slack = lp.num_vars;
        let first_artificial = first_slack + slacks;
        let width = first_artificial + artificials;

        let mut rows = Vec::with_capacity(m);
        let mut basis = Vec::with_capacity(m);
        let mut next_slack = first_slack;
        let mut next_artificial = first_artificial;

        for c in &lp.constraints {
            let mut row = vec![0.0; width + 1];
            let sign = if c.rhs < 0.0 { -1.0 } else { 1.0 };
            for (j, &a) in c.coeffs.iter().enumerate() {
                row[j] = sign * a;
            }
            row[width] = sign * c.rhs;

            // after normalizing rhs >= 0 a flipped row changes sense
            let relation = match (c.relation, sign < 0.0) {
                (Relation::LessEq, true) => Relation::GreaterEq,
                (Relation::GreaterEq, true) => Relation::LessEq,
                (relation, _) => relation,
            };
            match relation {
                Relation::LessEq => {
                    row[next_slack] = 1.0;
                    basis.push(next_slack);
                    next_slack += 1;
                }
                Relation::GreaterEq => {
                    row[next_slack] = -1.0;
                    next_slack += 1;
                    row[next_artificial] = 1.0;
                    basis.push(next_artificial);
                    next_artificial += 1;
                }
                Relation::Equal => {
                    row[next_artificial] = 1.0;
                    basis.push(next_artificial);
                    next_artificial += 1;
                }
            }
            rows.push(row);
        }

        Self {
            rows,
            basis,
            num_vars: lp.num_vars,
            first_artificial,
            width,
        }
    }

    fn solve(mut self, objective: &[f64]) -> Result<Vec<f64>, LpError> {
        if self.first_artificial < self.width {
            let mut phase_one = vec![0.0; self.width];
            for cost in &mut phase_one[self.first_artificial..] {
                *cost = 1.0;
            }
            let residual = self.optimize(&phase_one, self.width)?;
            if residual > EPS * (1.0 + self.rhs_scale()) {
                return Err(LpError::Infeasible);
            }
            self.evict_artificials();
        }

        let mut costs = vec![0.0; self.width];
        costs[..self.num_vars].copy_from_slice(objective);
        self.optimize(&costs, self.first_artificial)?;

        let mut x = vec![0.0; self.num_vars];
        for (row, &var) in self.rows.iter().zip(&self.basis) {
            if var < self.num_vars {
                x[var] = row[self.width].max(0.0);
            }
        }
        Ok(x)
    }

    fn rhs_scale(&self) -> f64 {
        self.rows.iter().map(|r| r[self.width].abs()).fold(0.0, f64::max)
    }

    /// Run simplex pivots; only columns below `enterable` may enter
    fn optimize(&mut self, costs: &[f64], enterable: usize) -> Result<f64, LpError> {
        let width = self.width;
        let mut reduced = vec![0.0; width + 1];
        reduced[..width].copy_from_slice(costs);
        for (row, &var) in self.rows.iter().zip(&self.basis) {
            let cb = costs[var];
            if cb != 0.0 {
                for (r, a) in reduced.iter_mut().zip(row) {
                    *r -= cb * a;
                }
            }
        }

        for _ in 0..MAX_PIVOTS {
            let Some(col) = (0..enterable).find(|&j| reduced[j] < -EPS) else {
                return Ok(-reduced[width]);
            };

            let mut leave: Option<(usize, f64)> = None;
            for (i, row) in self.rows.iter().enumerate() {
                if row[col] > EPS {
                    let ratio = row[width] / row[col];
                    let better = match leave {
                        None => true,
                        Some((best, best_ratio)) => {
                            ratio < best_ratio - EPS
                                || (ratio <= best_ratio + EPS && self.basis[i] < self.basis[best])
                        }
                    };
                    if better {
                        leave = Some((i, ratio));
                    }
                }
            }
            let Some((pivot_row, _)) = leave else {
                return Err(LpError::Unbounded);
            };

            self.pivot(pivot_row, col);
            let factor = reduced[col];
            if factor != 0.0 {
                for (r, a) in reduced.iter_mut().zip(&self.rows[pivot_row]) {
                    *r -= factor * a;
                }
            }
        }
        Err(LpError::IterationLimit(MAX_PIVOTS))
    }

    fn pivot(&mut self, pivot_row: usize, col: usize) {
        let divisor = self.rows[pivot_row][col];
        for a in &mut self.rows[pivot_row] {
            *a /= divisor;
        }
        let pivot = self.rows[pivot_row].clone();
        for (i, row) in self.rows.iter_mut().enumerate() {
            if i == pivot_row {
                continue;
            }
            let factor = row[col];
            if factor != 0.0 {
                for (a, p) in row.iter_mut().zip(&pivot) {
                    *a -= factor * p;
                }
            }
        }
        self.basis[pivot_row] = col;
    }

    /// Pivot zero-valued artificials out of the basis where possible
    fn evict_artificials(&mut self) {
        for i in 0..self.rows.len() {
            if self.basis[i] < self.first_artificial {
                continue;
            }
            if let Some(col) = (0..self.first_artificial).find(|&j| self.rows[i][j].abs() > EPS) {
                self.pivot(i, col);
            }
        }
    }
}
