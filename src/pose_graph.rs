//! Pose graph over finished sub-maps
//!
//! Nodes are sub-map poses in the (x, y, z, yaw) parameterization;
//! factors are pairwise registration constraints. Optimization runs an
//! in-crate Levenberg–Marquardt driver over the stacked residuals of
//! all constraints: residual blocks are evaluated in parallel, the
//! normal equations are solved by dense Cholesky, and steps are applied
//! through the wrap-aware plus-operator. The registration costs borrow
//! the sub-map collection read-only for exactly one `optimize` call.

use crate::collection::SubmapCollection;
use crate::error::{Error, Result};
use crate::registration::{JacobianBlocks, RegistrationCost, RegistrationCostOptions};
use crate::submap::SubmapId;
use crate::transform::{Pose, XyzYaw};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix4};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// 4×4 information (inverse covariance) matrix of a constraint
pub type InformationMatrix = Matrix4<f64>;

/// Lifecycle of a node inside the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Added,
    Initialized,
    Optimized,
}

/// A sub-map pose variable
#[derive(Debug, Clone)]
pub struct SubmapNode {
    submap_id: SubmapId,
    /// Substitution base; pitch and roll stay locked to this pose
    initial_pose: Pose,
    /// Canonical optimization variable
    pose_param: XyzYaw,
    constant: bool,
    state: NodeState,
}

impl SubmapNode {
    pub fn submap_id(&self) -> SubmapId {
        self.submap_id
    }

    pub fn pose_param(&self) -> XyzYaw {
        self.pose_param
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Full pose reconstructed from the optimized 4-vector
    pub fn pose(&self) -> Pose {
        self.pose_param.reconstruct(&self.initial_pose)
    }
}

/// Placeholder node anchoring a future odometry reference frame
///
/// Kept as a structure for forward compatibility; no constraint in this
/// crate consumes it.
#[derive(Debug, Clone)]
pub struct ReferenceFrameNode {
    pub id: u32,
    pub pose_param: XyzYaw,
}

/// A pairwise registration factor
#[derive(Debug, Clone)]
pub struct RegistrationConstraint {
    first: SubmapId,
    second: SubmapId,
    information: InformationMatrix,
    /// Mean diagonal of the Cholesky upper factor; the scalar gain
    /// applied to this constraint's residual rows
    sqrt_information_gain: f64,
}

impl RegistrationConstraint {
    pub fn first(&self) -> SubmapId {
        self.first
    }

    pub fn second(&self) -> SubmapId {
        self.second
    }

    pub fn information(&self) -> &InformationMatrix {
        &self.information
    }
}

/// Trust-region solver options (`submap_registration/solver`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_num_iterations: usize,
    pub parameter_tolerance: f64,
    pub function_tolerance: f64,
    /// When false the yaw component is held fixed for every node
    pub optimize_yaw: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_num_iterations: 40,
            parameter_tolerance: 3e-9,
            function_tolerance: 1e-8,
            optimize_yaw: true,
        }
    }
}

/// Why the solver stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A tolerance was satisfied
    Converged,
    /// Iteration cap reached
    MaxIterations,
    /// Damping grew without producing an acceptable step
    NoProgress,
    /// External cancellation; poses reverted to pre-call values
    Cancelled,
}

/// One accepted or rejected solver step
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub cost: f64,
    pub step_norm: f64,
    pub accepted: bool,
}

/// Result of one `optimize` call
#[derive(Debug, Clone)]
pub struct OptimizationSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: Vec<IterationRecord>,
    pub termination: Termination,
    pub total_time: Duration,
}

impl OptimizationSummary {
    /// Whether the caller may apply the resulting poses
    pub fn is_solution_usable(&self) -> bool {
        self.termination != Termination::Cancelled && self.final_cost.is_finite()
    }

    pub fn num_iterations(&self) -> usize {
        self.iterations.len()
    }
}

/// Nonlinear least-squares pose graph
#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    nodes: BTreeMap<SubmapId, SubmapNode>,
    reference_frame_nodes: BTreeMap<u32, ReferenceFrameNode>,
    constraints: Vec<RegistrationConstraint>,
    constraint_pairs: FxHashSet<(SubmapId, SubmapId)>,
    cost_options: RegistrationCostOptions,
    initialized: bool,
}

impl PoseGraph {
    pub fn new(cost_options: RegistrationCostOptions) -> Self {
        Self {
            cost_options,
            ..Self::default()
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn node(&self, submap_id: SubmapId) -> Option<&SubmapNode> {
        self.nodes.get(&submap_id)
    }

    pub fn constraints(&self) -> &[RegistrationConstraint] {
        &self.constraints
    }

    /// Add a sub-map node; idempotent by id
    ///
    /// The first node added is forced constant so the graph stays
    /// anchored to the world frame.
    pub fn add_node(&mut self, submap_id: SubmapId, initial_pose: Pose, constant: bool) {
        if self.nodes.contains_key(&submap_id) {
            return;
        }
        let constant = constant || self.nodes.is_empty();
        self.nodes.insert(
            submap_id,
            SubmapNode {
                submap_id,
                initial_pose,
                pose_param: XyzYaw::from_pose(&initial_pose),
                constant,
                state: NodeState::Added,
            },
        );
        self.initialized = false;
    }

    /// Add a reference-frame placeholder node
    pub fn add_reference_frame_node(&mut self, id: u32, pose_param: XyzYaw) {
        self.reference_frame_nodes
            .entry(id)
            .or_insert(ReferenceFrameNode { id, pose_param });
    }

    /// Add a registration constraint between two distinct sub-maps
    ///
    /// Self-edges and duplicate unordered pairs are rejected; the first
    /// constraint added for a pair is kept. The information matrix must
    /// be positive definite.
    pub fn add_constraint(
        &mut self,
        first: SubmapId,
        second: SubmapId,
        information: InformationMatrix,
    ) -> Result<()> {
        if first == second {
            return Err(Error::SelfConstraint(first));
        }
        let key = (first.min(second), first.max(second));
        if !self.constraint_pairs.insert(key) {
            return Err(Error::DuplicateConstraint(first, second));
        }

        let Some(cholesky) = information.cholesky() else {
            self.constraint_pairs.remove(&key);
            return Err(Error::InvalidInformationMatrix(first, second));
        };
        // Registration residuals are scalar per voxel, so the 4×4 factor
        // collapses to the mean diagonal gain of its Cholesky factor
        let sqrt_information_gain = cholesky.l().diagonal().mean();

        self.constraints.push(RegistrationConstraint {
            first,
            second,
            information,
            sqrt_information_gain,
        });
        self.initialized = false;
        Ok(())
    }

    /// Validate the graph and materialize the parameter blocks
    ///
    /// Fails with [`Error::UnknownSubmap`] when a constraint references
    /// a sub-map that has no node.
    pub fn initialize(&mut self) -> Result<()> {
        for constraint in &self.constraints {
            for id in [constraint.first, constraint.second] {
                if !self.nodes.contains_key(&id) {
                    return Err(Error::UnknownSubmap(id));
                }
            }
        }
        for node in self.nodes.values_mut() {
            if node.state == NodeState::Added {
                node.state = NodeState::Initialized;
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Optimized (or initial) poses of all nodes
    pub fn submap_poses(&self) -> BTreeMap<SubmapId, Pose> {
        self.nodes
            .iter()
            .map(|(id, node)| (*id, node.pose()))
            .collect()
    }

    /// Write the graph's poses back into the collection
    pub fn update_collection_poses(&self, collection: &mut SubmapCollection) -> Result<()> {
        for (id, pose) in self.submap_poses() {
            collection.set_submap_pose(id, pose)?;
        }
        Ok(())
    }

    /// Jointly refine all non-constant node poses
    pub fn optimize(
        &mut self,
        collection: &SubmapCollection,
        options: &SolverOptions,
    ) -> Result<OptimizationSummary> {
        self.optimize_with_cancel(collection, options, None)
    }

    /// [`PoseGraph::optimize`] with an external cancellation flag,
    /// honored at iteration boundaries; on cancel all pose parameters
    /// revert to their pre-call values
    pub fn optimize_with_cancel(
        &mut self,
        collection: &SubmapCollection,
        options: &SolverOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<OptimizationSummary> {
        let start = Instant::now();
        if !self.initialized {
            self.initialize()?;
        }

        // One cost block per constraint, borrowing the collection for
        // the duration of this call only
        let mut costs: Vec<RegistrationCost<'_>> = Vec::with_capacity(self.constraints.len());
        for constraint in &self.constraints {
            let reference = collection.submap(constraint.first)?;
            let reading = collection.submap(constraint.second)?;
            let mut cost = RegistrationCost::new(reference, reading, self.cost_options.clone())?;
            cost.set_gain(constraint.sqrt_information_gain);
            costs.push(cost);
        }

        // Free parameter layout: ascending node id, 4 or 3 components
        let comps: usize = if options.optimize_yaw { 4 } else { 3 };
        let free_ids: Vec<SubmapId> = self
            .nodes
            .values()
            .filter(|n| !n.constant)
            .map(|n| n.submap_id)
            .collect();
        let col_of: BTreeMap<SubmapId, usize> = free_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i * comps))
            .collect();

        let pre_call_params: BTreeMap<SubmapId, XyzYaw> = self
            .nodes
            .iter()
            .map(|(id, n)| (*id, n.pose_param))
            .collect();
        let mut params = pre_call_params.clone();

        let num_rows: usize = costs.iter().map(|c| c.residual_count()).sum();
        let num_cols = free_ids.len() * comps;

        let mut summary = OptimizationSummary {
            initial_cost: 0.0,
            final_cost: 0.0,
            iterations: Vec::new(),
            termination: Termination::MaxIterations,
            total_time: Duration::ZERO,
        };

        let mut current_cost =
            self.stacked_cost(&costs, &params, num_rows, None, comps, &col_of).1;
        summary.initial_cost = current_cost;
        debug!(
            "pose graph solve: {} nodes ({} free), {} constraints, {} residuals, initial cost {current_cost:.6e}",
            self.nodes.len(),
            free_ids.len(),
            costs.len(),
            num_rows
        );

        if num_cols == 0 {
            // Nothing to optimize
            summary.termination = Termination::Converged;
            summary.final_cost = current_cost;
            summary.total_time = start.elapsed();
            return Ok(summary);
        }

        let mut lambda = 1e-4;
        for iteration in 0..options.max_num_iterations {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    info!("pose graph optimization cancelled at iteration {iteration}");
                    for (id, node) in self.nodes.iter_mut() {
                        node.pose_param = pre_call_params[id];
                    }
                    summary.termination = Termination::Cancelled;
                    summary.final_cost = summary.initial_cost;
                    summary.total_time = start.elapsed();
                    return Ok(summary);
                }
            }

            let (system, cost_now) = self.stacked_cost(
                &costs,
                &params,
                num_rows,
                Some(num_cols),
                comps,
                &col_of,
            );
            current_cost = cost_now;
            let (jacobian, residuals) = system.expect("jacobian requested");

            let gradient = jacobian.transpose() * &residuals;
            if gradient.amax() < 1e-15 {
                summary.termination = Termination::Converged;
                break;
            }
            let hessian = jacobian.transpose() * &jacobian;

            // Damped normal equations; retry with stronger damping until
            // the step reduces the cost
            let mut accepted = false;
            while lambda < 1e10 {
                let mut damped = hessian.clone();
                for i in 0..num_cols {
                    let d = hessian[(i, i)].max(1e-12);
                    damped[(i, i)] += lambda * d;
                }
                let Some(step) = damped.cholesky().map(|ch| ch.solve(&(-&gradient))) else {
                    lambda *= 4.0;
                    continue;
                };

                let trial = Self::apply_step(&params, &free_ids, &step, comps, &col_of);
                let trial_cost = self
                    .stacked_cost(&costs, &trial, num_rows, None, comps, &col_of)
                    .1;
                let step_norm = step.norm();

                if trial_cost < current_cost {
                    params = trial;
                    summary.iterations.push(IterationRecord {
                        cost: trial_cost,
                        step_norm,
                        accepted: true,
                    });
                    lambda = (lambda * 0.5).max(1e-12);

                    let param_norm: f64 = params
                        .values()
                        .map(|p| {
                            let a = p.as_array();
                            a.iter().map(|v| v * v).sum::<f64>()
                        })
                        .sum::<f64>()
                        .sqrt();
                    let cost_drop = current_cost - trial_cost;
                    current_cost = trial_cost;
                    accepted = true;

                    if step_norm
                        <= options.parameter_tolerance * (param_norm + options.parameter_tolerance)
                        || cost_drop <= options.function_tolerance * current_cost.max(1e-300)
                    {
                        summary.termination = Termination::Converged;
                    }
                    break;
                }

                summary.iterations.push(IterationRecord {
                    cost: trial_cost,
                    step_norm,
                    accepted: false,
                });
                lambda *= 4.0;
            }

            if !accepted {
                summary.termination = Termination::NoProgress;
                break;
            }
            if summary.termination == Termination::Converged {
                break;
            }
        }

        for (id, node) in self.nodes.iter_mut() {
            node.pose_param = params[id];
            node.state = NodeState::Optimized;
        }

        summary.final_cost = current_cost;
        summary.total_time = start.elapsed();
        match summary.termination {
            Termination::Converged => {
                info!(
                    "pose graph converged: cost {:.6e} -> {:.6e} in {} steps ({:?})",
                    summary.initial_cost,
                    summary.final_cost,
                    summary.num_iterations(),
                    summary.total_time
                )
            }
            _ => warn!(
                "{}",
                Error::NotConverged(format!(
                    "stopped after {} steps with cost {:.6e} ({:?})",
                    summary.num_iterations(),
                    summary.final_cost,
                    summary.termination
                ))
            ),
        }
        Ok(summary)
    }

    /// Evaluate all residual blocks at `params`; returns the optional
    /// stacked (jacobian, residuals) and the total cost `½‖r‖²`
    #[allow(clippy::type_complexity)]
    fn stacked_cost(
        &self,
        costs: &[RegistrationCost<'_>],
        params: &BTreeMap<SubmapId, XyzYaw>,
        num_rows: usize,
        jacobian_cols: Option<usize>,
        comps: usize,
        col_of: &BTreeMap<SubmapId, usize>,
    ) -> (Option<(DMatrix<f64>, DVector<f64>)>, f64) {
        let poses: BTreeMap<SubmapId, Pose> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, params[id].reconstruct(&node.initial_pose)))
            .collect();

        struct BlockEval {
            first: SubmapId,
            second: SubmapId,
            residuals: Vec<f64>,
            jac_first: Option<Vec<[f64; 4]>>,
            jac_second: Option<Vec<[f64; 4]>>,
        }

        let with_jacobians = jacobian_cols.is_some();
        let evals: Vec<BlockEval> = costs
            .par_iter()
            .zip(self.constraints.par_iter())
            .map(|(cost, constraint)| {
                let n = cost.residual_count();
                let mut residuals = vec![0.0; n];
                let first_pose = &poses[&constraint.first];
                let second_pose = &poses[&constraint.second];
                if with_jacobians {
                    let mut jac_first = vec![[0.0; 4]; n];
                    let mut jac_second = vec![[0.0; 4]; n];
                    cost.evaluate(
                        first_pose,
                        second_pose,
                        &mut residuals,
                        Some(JacobianBlocks {
                            reference: &mut jac_first,
                            reading: &mut jac_second,
                        }),
                    );
                    BlockEval {
                        first: constraint.first,
                        second: constraint.second,
                        residuals,
                        jac_first: Some(jac_first),
                        jac_second: Some(jac_second),
                    }
                } else {
                    cost.evaluate(first_pose, second_pose, &mut residuals, None);
                    BlockEval {
                        first: constraint.first,
                        second: constraint.second,
                        residuals,
                        jac_first: None,
                        jac_second: None,
                    }
                }
            })
            .collect();

        let mut total_cost = 0.0;
        let mut stacked = jacobian_cols.map(|cols| {
            (
                DMatrix::zeros(num_rows, cols),
                DVector::zeros(num_rows),
            )
        });

        let mut row = 0;
        for eval in evals {
            for (i, r) in eval.residuals.iter().enumerate() {
                total_cost += 0.5 * r * r;
                if let Some((_, residuals)) = stacked.as_mut() {
                    residuals[row + i] = *r;
                }
            }
            if let Some((jacobian, _)) = stacked.as_mut() {
                for (id, block) in [
                    (eval.first, eval.jac_first.as_ref()),
                    (eval.second, eval.jac_second.as_ref()),
                ] {
                    let (Some(col), Some(block)) = (col_of.get(&id), block) else {
                        continue; // constant node: no columns
                    };
                    for (i, jac_row) in block.iter().enumerate() {
                        for k in 0..comps {
                            jacobian[(row + i, col + k)] = jac_row[k];
                        }
                    }
                }
            }
            row += eval.residuals.len();
        }

        (stacked, total_cost)
    }

    fn apply_step(
        params: &BTreeMap<SubmapId, XyzYaw>,
        free_ids: &[SubmapId],
        step: &DVector<f64>,
        comps: usize,
        col_of: &BTreeMap<SubmapId, usize>,
    ) -> BTreeMap<SubmapId, XyzYaw> {
        let mut next = params.clone();
        for id in free_ids {
            let col = col_of[id];
            let mut delta = [0.0; 4];
            for k in 0..comps {
                delta[k] = step[col + k];
            }
            next.insert(*id, params[id].plus(&delta));
        }
        next
    }
}
