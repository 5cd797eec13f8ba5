use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::{
    sync::{Mutex, RwLock},
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Settings,
    launcher::ProcessLauncher,
    registry::{self, record_audit, AuditKind, AuditStore},
    runtime::{SystemProbe, SystemResources},
    MonoopsError, MonoopsResult,
};

use super::{
    default_enforcers, Allocation, EnforcementMethod, LimitEnforcer, OptimizationPlan,
    Recommendation, RecommendationAction, ResourceKind, ResourceLimits, ResourceMetrics,
    ResourceRequirements, UsagePrediction,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Never promise more than this share of what currently appears free.
const FREE_CAPACITY_SHARE: f64 = 0.8;

/// Samples used for trend fitting.
const PREDICTION_WINDOW: usize = 50;

/// Bounds of the prediction confidence.
const MIN_CONFIDENCE: f64 = 0.3;
const MAX_CONFIDENCE: f64 = 0.95;

/// Safety margins over a prediction, for confident and unsure forecasts.
const CONFIDENT_MARGIN: f64 = 1.4;
const UNSURE_MARGIN: f64 = 1.5;

/// Buffers over observed peaks used by the optimizer.
const CPU_BUFFER: f64 = 0.2;
const MEMORY_BUFFER: f64 = 0.3;

/// A reduction is only recommended if the target is below this share of the current limit.
const REDUCE_THRESHOLD: f64 = 0.8;

/// An increase is recommended when the peak is within this share of the current limit.
const INCREASE_HEADROOM: f64 = 0.05;

/// Samples in the auto-scaler's moving average.
const AUTOSCALE_WINDOW: usize = 5;

/// Scale down when usage is below this share of the scale-up threshold.
const SCALE_DOWN_FACTOR: f64 = 0.3;

/// Growth and shrink factors applied per auto-scale step.
const SCALE_UP_STEP: f64 = 1.25;
const SCALE_DOWN_STEP: f64 = 0.8;

/// Upper bound on retained samples per project, on top of the age-based retention.
const MAX_HISTORY_SAMPLES: usize = 50_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Grants, enforces, samples and tunes per-project resource limits.
pub struct ResourceAllocator {
    settings: Settings,
    launcher: Arc<ProcessLauncher>,
    probe: Arc<SystemProbe>,
    audit: Arc<dyn AuditStore>,
    enforcers: Vec<Arc<dyn LimitEnforcer>>,

    /// Current allocation per project.
    allocations: RwLock<HashMap<String, Allocation>>,

    /// Usage samples per project, oldest first.
    history: RwLock<HashMap<String, VecDeque<ResourceMetrics>>>,

    /// Cancellation tokens of the per-project monitor and auto-scale workers.
    workers: Mutex<HashMap<String, CancellationToken>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceAllocator {
    /// Creates an allocator using the default enforcement chain.
    pub fn new(
        settings: Settings,
        launcher: Arc<ProcessLauncher>,
        probe: Arc<SystemProbe>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self::with_enforcers(settings, launcher, probe, audit, default_enforcers())
    }

    /// Creates an allocator trying `enforcers` in order.
    pub fn with_enforcers(
        settings: Settings,
        launcher: Arc<ProcessLauncher>,
        probe: Arc<SystemProbe>,
        audit: Arc<dyn AuditStore>,
        enforcers: Vec<Arc<dyn LimitEnforcer>>,
    ) -> Self {
        Self {
            settings,
            launcher,
            probe,
            audit,
            enforcers,
            allocations: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Grants limits within `[min, max]` and applies them, then starts the project's monitor and
    /// auto-scale workers.
    pub async fn allocate_resources(
        self: &Arc<Self>,
        project_id: &str,
        requirements: ResourceRequirements,
    ) -> MonoopsResult<Allocation> {
        requirements.validate()?;
        registry::resolve_project(self.launcher.registry().as_ref(), project_id).await?;

        let system = self.get_system_resources().await?;
        let limits = compute_limits(&requirements, &system);

        tracing::info!(
            project_id,
            cpu_percent = limits.cpu_percent,
            memory_mb = limits.memory_mb,
            priority = ?requirements.priority,
            "computed allocation"
        );

        let allocation = self.apply(project_id, limits, requirements).await;
        self.spawn_workers(project_id).await;
        Ok(allocation)
    }

    /// Replaces a project's limits, keeping its requirements if it already has an allocation.
    ///
    /// Limits outside an existing allocation's `[min, max]` windows are rejected.
    pub async fn set_limits(
        &self,
        project_id: &str,
        limits: ResourceLimits,
    ) -> MonoopsResult<Allocation> {
        limits.validate()?;
        let existing = self
            .allocations
            .read()
            .await
            .get(project_id)
            .map(|a| a.requirements.clone());

        let requirements = match existing {
            Some(requirements) => {
                requirements.admits(&limits)?;
                requirements
            }
            None => ResourceRequirements::fixed(&limits),
        };

        Ok(self.apply(project_id, limits, requirements).await)
    }

    /// Returns a project's current allocation.
    pub async fn get_allocation(&self, project_id: &str) -> Option<Allocation> {
        self.allocations.read().await.get(project_id).cloned()
    }

    /// Samples a project's usage and appends it to the history.
    pub async fn monitor_usage(&self, project_id: &str) -> MonoopsResult<ResourceMetrics> {
        let entry =
            registry::resolve_project(self.launcher.registry().as_ref(), project_id).await?;
        let known_pids = self.launcher.tracked_pids(project_id).await;

        let probe = self.probe.clone();
        let id = project_id.to_string();
        let (samples, system) = tokio::task::spawn_blocking(move || {
            let samples = probe.project_processes(&id, &entry.path, &known_pids);
            (samples, probe.system_resources())
        })
        .await?;

        let cores = system.cpu_cores.max(1) as f64;
        let memory_bytes: u64 = samples.iter().map(|s| s.memory_bytes).sum();
        let memory_mb = memory_bytes as f64 / (1024.0 * 1024.0);

        let metrics = ResourceMetrics {
            project_id: project_id.to_string(),
            timestamp: Utc::now(),
            cpu_percent: samples.iter().map(|s| s.cpu_percent as f64).sum::<f64>() / cores,
            memory_mb,
            memory_percent: if system.total_memory_mb > 0 {
                memory_mb / system.total_memory_mb as f64 * 100.0
            } else {
                0.0
            },
            disk_read_bytes: samples.iter().map(|s| s.disk_read_bytes).sum(),
            disk_write_bytes: samples.iter().map(|s| s.disk_write_bytes).sum(),
            network_connections: samples.iter().filter_map(|s| s.open_sockets).sum(),
            process_count: samples.len(),
            open_files: samples.iter().filter_map(|s| s.open_files).sum(),
        };

        self.record_sample(metrics.clone()).await;
        tracing::debug!(
            project_id,
            cpu_percent = metrics.cpu_percent,
            memory_mb = metrics.memory_mb,
            processes = metrics.process_count,
            "sampled usage"
        );
        Ok(metrics)
    }

    /// Appends a sample, pruning anything past the retention window.
    pub async fn record_sample(&self, metrics: ResourceMetrics) {
        let cutoff = Utc::now() - ChronoDuration::days(*self.settings.get_metrics_retention_days());
        let mut history = self.history.write().await;
        let samples = history.entry(metrics.project_id.clone()).or_default();
        samples.push_back(metrics);
        while samples
            .front()
            .is_some_and(|s| s.timestamp < cutoff || samples.len() > MAX_HISTORY_SAMPLES)
        {
            samples.pop_front();
        }
    }

    /// Returns a project's samples, oldest first.
    pub async fn get_history(&self, project_id: &str) -> Vec<ResourceMetrics> {
        self.history
            .read()
            .await
            .get(project_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forecasts usage `horizon_hours` ahead from the recent trend.
    pub async fn predict_usage(
        &self,
        project_id: &str,
        horizon_hours: f64,
    ) -> MonoopsResult<UsagePrediction> {
        if !(horizon_hours.is_finite() && horizon_hours >= 0.0) {
            return Err(MonoopsError::Validation(format!(
                "invalid horizon: {}",
                horizon_hours
            )));
        }

        let history = self.get_history(project_id).await;
        if history.is_empty() {
            return Err(MonoopsError::Validation(format!(
                "no usage history for {}",
                project_id
            )));
        }

        let current = self
            .get_allocation(project_id)
            .await
            .map(|a| a.limits);
        Ok(predict(project_id, &history, horizon_hours, current.as_ref()))
    }

    /// Compares each project's limits with its observed usage and recommends changes.
    pub async fn optimize_allocation(&self, project_ids: &[String]) -> OptimizationPlan {
        let allocations = self.allocations.read().await.clone();
        let history = self.history.read().await;

        let mut inputs = Vec::new();
        let mut skipped = Vec::new();
        for id in project_ids {
            match (allocations.get(id), history.get(id)) {
                (Some(allocation), Some(samples)) if !samples.is_empty() => inputs.push((
                    id.clone(),
                    allocation.limits.clone(),
                    samples.iter().cloned().collect(),
                )),
                _ => skipped.push(id.clone()),
            }
        }
        drop(history);

        optimize(inputs, skipped)
    }

    /// Host capacity and load.
    pub async fn get_system_resources(&self) -> MonoopsResult<SystemResources> {
        let probe = self.probe.clone();
        Ok(tokio::task::spawn_blocking(move || probe.system_resources()).await?)
    }

    /// Drops a project's allocation and stops its workers. History is kept for optimization.
    pub async fn release(&self, project_id: &str) -> Option<Allocation> {
        if let Some(token) = self.workers.lock().await.remove(project_id) {
            token.cancel();
        }
        let removed = self.allocations.write().await.remove(project_id);
        if removed.is_some() {
            tracing::info!(project_id, "released allocation");
        }
        removed
    }

    /// Tries each enforcer in order and records the resulting allocation.
    async fn apply(
        &self,
        project_id: &str,
        limits: ResourceLimits,
        requirements: ResourceRequirements,
    ) -> Allocation {
        let pids = self.launcher.tracked_pids(project_id).await;
        let mut failures = Vec::new();
        let mut method = EnforcementMethod::None;

        for enforcer in &self.enforcers {
            if !enforcer.is_available().await {
                continue;
            }
            match enforcer
                .apply(project_id, &pids, &limits, requirements.priority)
                .await
            {
                Ok(()) => {
                    method = enforcer.method();
                    break;
                }
                Err(e) => {
                    tracing::debug!(project_id, method = %enforcer.method(), error = %e, "enforcer failed");
                    failures.push(format!("{}: {}", enforcer.method(), e));
                }
            }
        }

        let enforced = method != EnforcementMethod::None;
        let message = if enforced {
            None
        } else {
            let err = MonoopsError::EnforcementUnavailable(project_id.to_string());
            tracing::warn!(project_id, failures = ?failures, "{}", err);
            Some(if failures.is_empty() {
                err.to_string()
            } else {
                format!("{} ({})", err, failures.join("; "))
            })
        };

        let allocation = Allocation {
            project_id: project_id.to_string(),
            limits: limits.clone(),
            requirements,
            method,
            enforced,
            message,
            allocated_at: Utc::now(),
        };

        self.allocations
            .write()
            .await
            .insert(project_id.to_string(), allocation.clone());
        self.launcher.set_resource_limits(project_id, limits).await;
        record_audit(&self.audit, AuditKind::Allocation, project_id, &allocation);

        tracing::info!(project_id, method = %method, enforced, "applied limits");
        allocation
    }

    async fn spawn_workers(self: &Arc<Self>, project_id: &str) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .workers
            .lock()
            .await
            .insert(project_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        let this = Arc::clone(self);
        let id = project_id.to_string();
        let monitor_token = token.clone();
        tokio::spawn(async move { this.monitor_loop(&id, monitor_token).await });

        let this = Arc::clone(self);
        let id = project_id.to_string();
        tokio::spawn(async move { this.autoscale_loop(&id, token).await });
    }

    async fn monitor_loop(&self, project_id: &str, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = time::sleep(self.settings.monitor_interval()) => {}
            }
            if self.get_allocation(project_id).await.is_none() {
                break;
            }
            if let Err(e) = self.monitor_usage(project_id).await {
                tracing::warn!(project_id, error = %e, "usage sampling failed");
            }
        }
        tracing::debug!(project_id, "resource monitor stopped");
    }

    async fn autoscale_loop(&self, project_id: &str, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = time::sleep(self.settings.autoscale_interval()) => {}
            }
            let Some(allocation) = self.get_allocation(project_id).await else {
                break;
            };
            if !allocation.requirements.auto_scale {
                continue;
            }

            let history = self.get_history(project_id).await;
            let recent = &history[history.len().saturating_sub(AUTOSCALE_WINDOW)..];
            if let Some(limits) = autoscale_decision(&allocation, recent) {
                tracing::info!(
                    project_id,
                    cpu_percent = limits.cpu_percent,
                    memory_mb = limits.memory_mb,
                    "auto-scaling"
                );
                if let Err(e) = self.set_limits(project_id, limits).await {
                    tracing::warn!(project_id, error = %e, "auto-scale failed");
                }
            }
        }
        tracing::debug!(project_id, "auto-scaler stopped");
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives limits from a request: the priority share of the maximum, capped at 80% of free
/// capacity, clamped into `[min, max]`.
pub fn compute_limits(requirements: &ResourceRequirements, system: &SystemResources) -> ResourceLimits {
    let multiplier = requirements.priority.multiplier();

    let free_cpu = (100.0 - system.cpu_usage_percent as f64).max(0.0);
    let cpu_percent = (requirements.max_cpu_percent * multiplier)
        .min(free_cpu * FREE_CAPACITY_SHARE)
        .clamp(requirements.min_cpu_percent, requirements.max_cpu_percent);

    let free_memory = system.available_memory_mb as f64;
    let memory_mb = (requirements.max_memory_mb as f64 * multiplier)
        .min(free_memory * FREE_CAPACITY_SHARE)
        .floor()
        .clamp(requirements.min_memory_mb as f64, requirements.max_memory_mb as f64)
        as u64;

    if cpu_percent <= requirements.min_cpu_percent || memory_mb <= requirements.min_memory_mb {
        tracing::debug!(free_cpu, free_memory, "free capacity is at or below the requested minimum");
    }

    ResourceLimits {
        cpu_percent,
        cpu_cores: requirements
            .cpu_cores
            .map(|c| c.clamp(1, system.cpu_cores.max(1))),
        memory_mb,
        disk_read_mbps: requirements.disk_read_mbps,
        disk_write_mbps: requirements.disk_write_mbps,
        max_processes: requirements.max_processes,
        max_open_files: requirements.max_open_files,
    }
}

/// Least-squares slope and intercept of `ys` over `xs`.
fn linear_fit(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (num, den) = xs.iter().zip(ys).fold((0.0, 0.0), |(num, den), (x, y)| {
        (num + (x - mean_x) * (y - mean_y), den + (x - mean_x).powi(2))
    });
    let slope = if den == 0.0 { 0.0 } else { num / den };
    (slope, mean_y - slope * mean_x)
}

/// Coefficient of variation; zero for a zero mean.
fn variation(ys: &[f64]) -> f64 {
    let n = ys.len() as f64;
    let mean = ys.iter().sum::<f64>() / n;
    if mean.abs() < f64::EPSILON {
        return 0.0;
    }
    let variance = ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean.abs()
}

/// Fits a linear trend over the last samples and extrapolates it.
pub fn predict(
    project_id: &str,
    history: &[ResourceMetrics],
    horizon_hours: f64,
    current: Option<&ResourceLimits>,
) -> UsagePrediction {
    let window = &history[history.len().saturating_sub(PREDICTION_WINDOW)..];
    let origin = window[0].timestamp;
    let hours: Vec<f64> = window
        .iter()
        .map(|s| (s.timestamp - origin).num_milliseconds() as f64 / 3_600_000.0)
        .collect();
    let cpu: Vec<f64> = window.iter().map(|s| s.cpu_percent).collect();
    let memory: Vec<f64> = window.iter().map(|s| s.memory_mb).collect();

    let (cpu_slope, cpu_intercept) = linear_fit(&hours, &cpu);
    let (mem_slope, mem_intercept) = linear_fit(&hours, &memory);

    let target = hours.last().copied().unwrap_or(0.0) + horizon_hours;
    let predicted_cpu = (cpu_intercept + cpu_slope * target).clamp(0.0, 100.0);
    let predicted_memory = (mem_intercept + mem_slope * target).max(0.0);

    let confidence = if window.len() < 2 {
        MIN_CONFIDENCE
    } else {
        (1.0 - (variation(&cpu) + variation(&memory)) / 2.0).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
    };
    let margin = if confidence >= 0.6 {
        CONFIDENT_MARGIN
    } else {
        UNSURE_MARGIN
    };

    let recommended_limits = ResourceLimits {
        cpu_percent: (predicted_cpu * margin).clamp(1.0, 100.0),
        memory_mb: ((predicted_memory * margin).ceil() as u64).max(1),
        cpu_cores: current.and_then(|c| c.cpu_cores),
        disk_read_mbps: current.and_then(|c| c.disk_read_mbps),
        disk_write_mbps: current.and_then(|c| c.disk_write_mbps),
        max_processes: current.and_then(|c| c.max_processes),
        max_open_files: current.and_then(|c| c.max_open_files),
    };

    UsagePrediction {
        project_id: project_id.to_string(),
        horizon_hours,
        predicted_cpu_percent: predicted_cpu,
        predicted_memory_mb: predicted_memory,
        cpu_trend_per_hour: cpu_slope,
        memory_trend_per_hour: mem_slope,
        confidence,
        sample_count: window.len(),
        recommended_limits,
    }
}

/// Builds an optimization plan from `(project, limits, samples)` triples.
pub fn optimize(
    inputs: Vec<(String, ResourceLimits, Vec<ResourceMetrics>)>,
    skipped: Vec<String>,
) -> OptimizationPlan {
    let mut recommendations = Vec::new();
    let mut relative_savings: Vec<(String, f64)> = Vec::new();

    for (project_id, limits, samples) in inputs {
        let n = samples.len() as f64;
        let avg_cpu = samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n;
        let peak_cpu = samples.iter().map(|s| s.cpu_percent).fold(0.0, f64::max);
        let avg_mem = samples.iter().map(|s| s.memory_mb).sum::<f64>() / n;
        let peak_mem = samples.iter().map(|s| s.memory_mb).fold(0.0, f64::max);

        let mut project_savings = 0.0;
        let checks = [
            (ResourceKind::Cpu, limits.cpu_percent, avg_cpu, peak_cpu, CPU_BUFFER),
            (ResourceKind::Memory, limits.memory_mb as f64, avg_mem, peak_mem, MEMORY_BUFFER),
        ];

        for (resource, current, avg, peak, buffer) in checks {
            if current <= 0.0 {
                continue;
            }
            let target = peak.max(avg) * (1.0 + buffer);

            let recommendation = if peak >= current * (1.0 - INCREASE_HEADROOM) {
                let recommended = target.max(current * (1.0 + buffer));
                Some((
                    RecommendationAction::Increase,
                    recommended,
                    format!("peak {:.1} is within 5% of the limit {:.1}", peak, current),
                ))
            } else if target < current * REDUCE_THRESHOLD {
                Some((
                    RecommendationAction::Reduce,
                    target,
                    format!(
                        "average {:.1} and peak {:.1} leave the limit {:.1} underused",
                        avg, peak, current
                    ),
                ))
            } else {
                None
            };

            if let Some((action, recommended, reason)) = recommendation {
                let recommended = match resource {
                    ResourceKind::Cpu => recommended.min(100.0),
                    ResourceKind::Memory => recommended.ceil(),
                };
                let savings = current - recommended;
                project_savings += savings / current;
                recommendations.push(Recommendation {
                    project_id: project_id.clone(),
                    resource,
                    action,
                    current,
                    recommended,
                    estimated_savings: savings,
                    reason,
                });
            }
        }

        relative_savings.push((project_id, project_savings));
    }

    relative_savings.sort_by(|a, b| b.1.total_cmp(&a.1));

    let total = |kind: ResourceKind| {
        recommendations
            .iter()
            .filter(|r| r.resource == kind)
            .map(|r| r.estimated_savings)
            .sum::<f64>()
    };

    OptimizationPlan {
        total_cpu_savings: total(ResourceKind::Cpu),
        total_memory_savings_mb: total(ResourceKind::Memory),
        implementation_order: relative_savings
            .into_iter()
            .filter(|(id, _)| recommendations.iter().any(|r| &r.project_id == id))
            .map(|(id, _)| id)
            .collect(),
        recommendations,
        skipped,
        generated_at: Utc::now(),
    }
}

/// Decides whether the auto-scaler should change an allocation given recent samples.
///
/// Grows a limit when the moving average exceeds the threshold (capped at the requested max), and
/// shrinks it when usage is below 30% of the threshold (floored at the requested min).
pub fn autoscale_decision(
    allocation: &Allocation,
    recent: &[ResourceMetrics],
) -> Option<ResourceLimits> {
    if recent.is_empty() {
        return None;
    }

    let requirements = &allocation.requirements;
    let threshold = requirements.scale_up_threshold;
    let n = recent.len() as f64;
    let avg_cpu = recent.iter().map(|s| s.cpu_percent).sum::<f64>() / n;
    let avg_mem = recent.iter().map(|s| s.memory_mb).sum::<f64>() / n;

    let mut limits = allocation.limits.clone();

    let cpu_usage = avg_cpu / limits.cpu_percent * 100.0;
    if cpu_usage > threshold {
        limits.cpu_percent = (limits.cpu_percent * SCALE_UP_STEP).min(requirements.max_cpu_percent);
    } else if cpu_usage < threshold * SCALE_DOWN_FACTOR {
        limits.cpu_percent =
            (limits.cpu_percent * SCALE_DOWN_STEP).max(requirements.min_cpu_percent);
    }

    let mem_usage = avg_mem / limits.memory_mb.max(1) as f64 * 100.0;
    if mem_usage > threshold {
        limits.memory_mb =
            ((limits.memory_mb as f64 * SCALE_UP_STEP) as u64).min(requirements.max_memory_mb);
    } else if mem_usage < threshold * SCALE_DOWN_FACTOR {
        limits.memory_mb =
            ((limits.memory_mb as f64 * SCALE_DOWN_STEP) as u64).max(requirements.min_memory_mb);
    }

    (limits != allocation.limits).then_some(limits)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Priority;

    fn system(cpu_usage: f32, available_mb: u64) -> SystemResources {
        SystemResources {
            cpu_cores: 4,
            cpu_usage_percent: cpu_usage,
            load_average: 0.0,
            total_memory_mb: 16_384,
            available_memory_mb: available_mb,
            total_disk_mb: 0,
            available_disk_mb: 0,
            network_received_bytes: 0,
            network_transmitted_bytes: 0,
        }
    }

    fn sample(minutes: i64, cpu: f64, memory: f64) -> ResourceMetrics {
        ResourceMetrics {
            project_id: "p".into(),
            timestamp: Utc::now() - ChronoDuration::hours(10) + ChronoDuration::minutes(minutes),
            cpu_percent: cpu,
            memory_mb: memory,
            memory_percent: 0.0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            network_connections: 0,
            process_count: 1,
            open_files: 0,
        }
    }

    fn limits(cpu: f64, memory: u64) -> ResourceLimits {
        ResourceLimits {
            cpu_percent: cpu,
            cpu_cores: None,
            memory_mb: memory,
            disk_read_mbps: None,
            disk_write_mbps: None,
            max_processes: None,
            max_open_files: None,
        }
    }

    #[test]
    fn test_limits_stay_within_requested_range() {
        let requirements = ResourceRequirements {
            min_cpu_percent: 10.0,
            max_cpu_percent: 40.0,
            min_memory_mb: 256,
            max_memory_mb: 2048,
            priority: Priority::Critical,
            ..Default::default()
        };

        for (cpu_usage, available) in [(0.0, 64_000), (50.0, 1_000), (99.9, 0), (100.0, 100)] {
            let granted = compute_limits(&requirements, &system(cpu_usage, available));
            assert!((10.0..=40.0).contains(&granted.cpu_percent), "{:?}", granted);
            assert!((256..=2048).contains(&granted.memory_mb), "{:?}", granted);
        }
    }

    #[test]
    fn test_priority_scales_the_grant() {
        let requirements = ResourceRequirements {
            min_cpu_percent: 1.0,
            max_cpu_percent: 50.0,
            min_memory_mb: 64,
            max_memory_mb: 1000,
            priority: Priority::Background,
            ..Default::default()
        };
        let granted = compute_limits(&requirements, &system(0.0, 100_000));
        assert!((granted.cpu_percent - 10.0).abs() < 1e-9);
        assert_eq!(granted.memory_mb, 200);
    }

    #[test]
    fn test_free_capacity_caps_the_grant() {
        let requirements = ResourceRequirements {
            min_cpu_percent: 1.0,
            max_cpu_percent: 100.0,
            min_memory_mb: 64,
            max_memory_mb: 8192,
            priority: Priority::Critical,
            ..Default::default()
        };
        let granted = compute_limits(&requirements, &system(50.0, 1000));
        assert!((granted.cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(granted.memory_mb, 800);
    }

    #[test]
    fn test_prediction_follows_trend() {
        let history: Vec<_> = (0..60)
            .map(|i| sample(i * 10, 10.0 + i as f64 * 0.5, 500.0 + i as f64 * 5.0))
            .collect();
        let prediction = predict("p", &history, 1.0, None);

        assert_eq!(prediction.sample_count, PREDICTION_WINDOW);
        assert!(prediction.cpu_trend_per_hour > 0.0);
        assert!(prediction.predicted_cpu_percent > history.last().unwrap().cpu_percent);
        assert!((MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&prediction.confidence));
        assert!(
            prediction.recommended_limits.cpu_percent >= prediction.predicted_cpu_percent * 1.4 - 1e-9
                || prediction.recommended_limits.cpu_percent == 100.0
        );
    }

    #[test]
    fn test_flat_usage_gives_high_confidence() {
        let history: Vec<_> = (0..10).map(|i| sample(i, 20.0, 300.0)).collect();
        let prediction = predict("p", &history, 24.0, None);
        assert_eq!(prediction.confidence, MAX_CONFIDENCE);
        assert!((prediction.predicted_cpu_percent - 20.0).abs() < 1e-6);
        assert!((prediction.recommended_limits.cpu_percent - 28.0).abs() < 1e-6);
    }

    #[test]
    fn test_optimizer_recommends_reduce_and_increase() {
        let idle: Vec<_> = (0..5).map(|i| sample(i, 5.0, 100.0)).collect();
        let busy: Vec<_> = (0..5).map(|i| sample(i, 49.0, 900.0)).collect();

        let plan = optimize(
            vec![
                ("idle".into(), limits(50.0, 1000), idle),
                ("busy".into(), limits(50.0, 2000), busy),
            ],
            vec!["new".into()],
        );

        let idle_cpu = plan
            .recommendations
            .iter()
            .find(|r| r.project_id == "idle" && r.resource == ResourceKind::Cpu)
            .expect("idle cpu recommendation");
        assert_eq!(idle_cpu.action, RecommendationAction::Reduce);
        assert!((idle_cpu.recommended - 6.0).abs() < 1e-9);

        let busy_cpu = plan
            .recommendations
            .iter()
            .find(|r| r.project_id == "busy" && r.resource == ResourceKind::Cpu)
            .expect("busy cpu recommendation");
        assert_eq!(busy_cpu.action, RecommendationAction::Increase);

        assert_eq!(plan.implementation_order.first().map(String::as_str), Some("idle"));
        assert_eq!(plan.skipped, vec!["new".to_string()]);
    }

    #[test]
    fn test_autoscale_respects_bounds() {
        let allocation = Allocation {
            project_id: "p".into(),
            limits: limits(40.0, 1000),
            requirements: ResourceRequirements {
                min_cpu_percent: 10.0,
                max_cpu_percent: 45.0,
                min_memory_mb: 900,
                max_memory_mb: 4000,
                auto_scale: true,
                ..Default::default()
            },
            method: EnforcementMethod::None,
            enforced: false,
            message: None,
            allocated_at: Utc::now(),
        };

        let hot: Vec<_> = (0..5).map(|i| sample(i, 39.0, 100.0)).collect();
        let scaled = autoscale_decision(&allocation, &hot).expect("scale");
        assert_eq!(scaled.cpu_percent, 45.0);
        assert_eq!(scaled.memory_mb, 900);

        let steady: Vec<_> = (0..5).map(|i| sample(i, 20.0, 500.0)).collect();
        assert!(autoscale_decision(&allocation, &steady).is_none());
    }

    #[test]
    fn test_limits_outside_allocated_range_are_rejected() {
        let requirements = ResourceRequirements {
            min_cpu_percent: 10.0,
            max_cpu_percent: 40.0,
            min_memory_mb: 64,
            max_memory_mb: 512,
            ..Default::default()
        };

        assert!(requirements.admits(&limits(40.0, 64)).is_ok());
        for outside in [limits(90.0, 256), limits(5.0, 256), limits(20.0, 4096), limits(20.0, 32)] {
            assert!(
                matches!(requirements.admits(&outside), Err(MonoopsError::Validation(_))),
                "{:?}",
                outside
            );
        }
    }
}
