use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::time::{Duration, Instant};

use crate::cpu::{CARRY, CPU_OFF, NEGATIVE, OVERFLOW, ZERO};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Counter for instructions executed by mnemonic
    pub static ref CPU_INSTRUCTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cpu_instructions_total", "Total number of CPU instructions executed by mnemonic"),
        &["instruction"]
    ).expect("Failed to create CPU instructions counter");

    /// Counter for all steps attempted, successful or not
    pub static ref CPU_STEPS_TOTAL: Counter = Counter::new(
        "cpu_steps_total", "Total number of CPU steps attempted"
    ).expect("Failed to create CPU steps counter");

    /// Histogram for instruction execution time
    pub static ref INSTRUCTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("instruction_duration_seconds", "Time spent executing instructions")
            .buckets(vec![0.000001, 0.000005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001]),
        &["instruction"]
    ).expect("Failed to create instruction duration histogram");

    /// Counter for API requests by endpoint and method
    pub static ref API_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("api_requests_total", "Total number of API requests"),
        &["method", "endpoint", "status"]
    ).expect("Failed to create API requests counter");

    /// Histogram for API request duration
    pub static ref API_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("api_request_duration_seconds", "API request duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "endpoint"]
    ).expect("Failed to create API request duration histogram");

    /// Gauge for live CPU instances
    pub static ref ACTIVE_INSTANCES: Gauge = Gauge::new(
        "active_instances_total", "Number of live CPU instances"
    ).expect("Failed to create active instances gauge");

    /// Gauge for CPU register values by instance name
    pub static ref CPU_REGISTER_VALUES: GaugeVec = GaugeVec::new(
        Opts::new("cpu_register_value", "Current CPU register values"),
        &["instance", "register"]
    ).expect("Failed to create CPU register values gauge");

    /// Gauge for status register flags by instance name
    pub static ref CPU_FLAGS: GaugeVec = GaugeVec::new(
        Opts::new("cpu_flags", "Current CPU flag states (0 or 1)"),
        &["instance", "flag"]
    ).expect("Failed to create CPU flags gauge");

    /// Counter for faults by error kind
    pub static ref CPU_FAULTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cpu_faults_total", "Total number of CPU faults"),
        &["instance", "kind"]
    ).expect("Failed to create CPU faults counter");

    /// Counter for peripheral hook invocations
    pub static ref HOOK_INVOCATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("hook_invocations_total", "Total number of memory hook invocations"),
        &["hook"]
    ).expect("Failed to create hook invocations counter");

    /// Counter for firmware image loads
    pub static ref IMAGE_LOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("image_loads_total", "Total number of firmware images loaded"),
        &["instance"]
    ).expect("Failed to create image loads counter");

    /// Counter for instance resets
    pub static ref INSTANCE_RESETS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("instance_resets_total", "Total number of instance resets"),
        &["instance"]
    ).expect("Failed to create instance resets counter");
}

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: &C) {
    match REGISTRY.register(Box::new(collector.clone())) {
        // Tests and embedders may initialise more than once.
        Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
        Err(err) => tracing::warn!(error = %err, "failed to register metric"),
    }
}

/// Initialize Prometheus metrics by registering them with the global registry
pub fn init_metrics() {
    register(&*CPU_INSTRUCTIONS_TOTAL);
    register(&*CPU_STEPS_TOTAL);
    register(&*INSTRUCTION_DURATION);
    register(&*API_REQUESTS_TOTAL);
    register(&*API_REQUEST_DURATION);
    register(&*ACTIVE_INSTANCES);
    register(&*CPU_REGISTER_VALUES);
    register(&*CPU_FLAGS);
    register(&*CPU_FAULTS_TOTAL);
    register(&*HOOK_INVOCATIONS_TOTAL);
    register(&*IMAGE_LOADS_TOTAL);
    register(&*INSTANCE_RESETS_TOTAL);
}

/// Record a successfully executed instruction
pub fn record_instruction(instruction_name: &str, duration: Duration) {
    CPU_INSTRUCTIONS_TOTAL
        .with_label_values(&[instruction_name])
        .inc();

    INSTRUCTION_DURATION
        .with_label_values(&[instruction_name])
        .observe(duration.as_secs_f64());
}

pub fn record_step() {
    CPU_STEPS_TOTAL.inc();
}

/// Record an API request
pub fn record_api_request(method: &str, endpoint: &str, status: u16, duration: Duration) {
    API_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();

    API_REQUEST_DURATION
        .with_label_values(&[method, endpoint])
        .observe(duration.as_secs_f64());
}

pub fn set_active_instances(count: usize) {
    ACTIVE_INSTANCES.set(count as f64);
}

/// Publish all sixteen registers of an instance
pub fn update_cpu_registers(instance: &str, regs: &[u16; 16]) {
    for (index, value) in regs.iter().enumerate() {
        CPU_REGISTER_VALUES
            .with_label_values(&[instance, &format!("r{}", index)])
            .set(*value as f64);
    }

    update_cpu_flags(instance, regs[crate::cpu::SR]);
}

/// Update status register flag metrics for an instance
pub fn update_cpu_flags(instance: &str, sr: u16) {
    let flags = [
        ("carry", CARRY),
        ("zero", ZERO),
        ("negative", NEGATIVE),
        ("cpu_off", CPU_OFF),
        ("overflow", OVERFLOW),
    ];

    for (name, bit) in flags {
        CPU_FLAGS
            .with_label_values(&[instance, name])
            .set(if sr & bit != 0 { 1.0 } else { 0.0 });
    }
}

pub fn record_fault(instance: &str, kind: &str) {
    CPU_FAULTS_TOTAL.with_label_values(&[instance, kind]).inc();
}

pub fn record_hook_invocation(hook: &str) {
    HOOK_INVOCATIONS_TOTAL.with_label_values(&[hook]).inc();
}

pub fn record_image_load(instance: &str) {
    IMAGE_LOADS_TOTAL.with_label_values(&[instance]).inc();
}

pub fn record_instance_reset(instance: &str) {
    INSTANCE_RESETS_TOTAL.with_label_values(&[instance]).inc();
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
