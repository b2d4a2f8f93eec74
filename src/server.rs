use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

use crate::error::ControlError;
use crate::hooks::instance_key;
use crate::instance::{BreakpointKind, CpuHandle, CpuStatus, Disassembly};
use crate::kv::KvHandle;
use crate::metrics::{record_api_request, Timer, REGISTRY};
use crate::registry::Registry;

const DEFAULT_MEMORY_LEN: u16 = 32;
const DEFAULT_INSN_COUNT: usize = 10;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegsUpdate {
    /// `null` leaves a register unchanged.
    pub regs: [Option<u16>; 16],
}

#[derive(Debug, Deserialize)]
pub struct MemoryQuery {
    pub len: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct InsnsQuery {
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MemoryData {
    pub address: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    /// Hex address.
    pub addr: String,
    /// `null` clears the breakpoint.
    pub kind: Option<BreakpointKind>,
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub input: String,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Boot,
    Continue,
    Step,
    Stop,
    Reset,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Control(ControlError),
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError::Control(err)
    }
}

impl From<crate::error::KvError> for ApiError {
    fn from(err: crate::error::KvError) -> Self {
        ApiError::Control(ControlError::Kv(err))
    }
}

/// What every handler needs.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Registry,
    pub kv: KvHandle,
}

fn with_context(ctx: ServerContext) -> impl Filter<Extract = (ServerContext,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn parse_address(text: &str) -> Result<u16, ApiError> {
    u16::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|err| ApiError::BadRequest(format!("bad address {}: {}", text, err)))
}

async fn lookup(ctx: &ServerContext, name: &str) -> Result<CpuHandle, ApiError> {
    Ok(ctx.registry.get(name).await?)
}

fn respond<T: Serialize>(
    method: &str,
    endpoint: &str,
    timer: Timer,
    result: Result<T, ApiError>,
) -> Result<warp::reply::WithStatus<warp::reply::Json>, warp::Rejection> {
    let (status, body) = match result {
        Ok(data) => (StatusCode::OK, warp::reply::json(&ApiResponse::success(data))),
        Err(err) => {
            let (status, message) = match err {
                ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
                ApiError::Control(err @ ControlError::NotReady) => (StatusCode::CONFLICT, err.to_string()),
                ApiError::Control(err @ (ControlError::Gone(_) | ControlError::Spawn(_))) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                }
                ApiError::Control(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            };
            (status, warp::reply::json(&ApiResponse::<T>::error(message)))
        }
    };

    record_api_request(method, endpoint, status.as_u16(), timer.elapsed());
    Ok(warp::reply::with_status(body, status))
}

/// All routes, for serving or for `warp::test`.
pub fn routes(ctx: ServerContext) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    // CORS
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST"]);

    let list_cpus = warp::path("cpus")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(list_cpus_handler);

    let get_status = warp::path!("cpu" / String)
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(status_handler);

    let get_regs = warp::path!("cpu" / String / "regs")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(get_regs_handler);

    let set_regs = warp::path!("cpu" / String / "regs")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(set_regs_handler);

    let read_memory = warp::path!("cpu" / String / "memory" / String)
        .and(warp::get())
        .and(warp::query::<MemoryQuery>())
        .and(with_context(ctx.clone()))
        .and_then(read_memory_handler);

    let disassemble = warp::path!("cpu" / String / "memory" / String / "insns")
        .and(warp::get())
        .and(warp::query::<InsnsQuery>())
        .and(with_context(ctx.clone()))
        .and_then(disassemble_handler);

    let get_events = warp::path!("cpu" / String / "events")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(events_handler);

    let set_event = warp::path!("cpu" / String / "event")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(event_handler);

    let load = warp::path!("cpu" / String / "load")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(load_handler);

    let input = warp::path!("cpu" / String / "input")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(input_handler);

    let output = warp::path!("cpu" / String / "output")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(output_handler);

    let debug_log = warp::path!("cpu" / String / "debuglog")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(debug_log_handler);

    // Metrics endpoint
    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(metrics_handler);

    list_cpus
        .or(get_status)
        .or(get_regs)
        .or(set_regs)
        .or(read_memory)
        .or(disassemble)
        .or(get_events)
        .or(set_event)
        .or(load)
        .or(input)
        .or(output)
        .or(debug_log)
        .or(action_route("boot", Action::Boot, ctx.clone()))
        .or(action_route("continue", Action::Continue, ctx.clone()))
        .or(action_route("step", Action::Step, ctx.clone()))
        .or(action_route("stop", Action::Stop, ctx.clone()))
        .or(action_route("reset", Action::Reset, ctx))
        .or(metrics)
        .with(cors)
}

pub async fn run_server(addr: SocketAddr, ctx: ServerContext) {
    info!(%addr, "msp430 debug service listening");
    warp::serve(routes(ctx)).run(addr).await;
}

fn action_route(
    segment: &'static str,
    action: Action,
    ctx: ServerContext,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("cpu")
        .and(warp::path::param::<String>())
        .and(warp::path(segment))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_context(ctx))
        .and_then(move |name: String, ctx: ServerContext| control_handler(name, action, ctx))
}

async fn list_cpus_handler(ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = ctx.registry.names().await.map_err(ApiError::from);
    respond("GET", "/cpus", timer, result)
}

async fn status_handler(name: String, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let cpu = lookup(&ctx, &name).await?;
        Ok::<CpuStatus, ApiError>(cpu.status().await?)
    }
    .await;
    respond("GET", "/cpu/:name", timer, result)
}

async fn get_regs_handler(name: String, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let cpu = lookup(&ctx, &name).await?;
        Ok::<[u16; 16], ApiError>(cpu.registers().await?)
    }
    .await;
    respond("GET", "/cpu/:name/regs", timer, result)
}

async fn set_regs_handler(name: String, update: RegsUpdate, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let cpu = lookup(&ctx, &name).await?;
        cpu.set_registers(update.regs).await?;
        Ok::<[u16; 16], ApiError>(cpu.registers().await?)
    }
    .await;
    respond("POST", "/cpu/:name/regs", timer, result)
}

async fn read_memory_handler(
    name: String,
    address: String,
    query: MemoryQuery,
    ctx: ServerContext,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let address = parse_address(&address)?;
        let cpu = lookup(&ctx, &name).await?;
        let data = cpu.read_memory(address, query.len.unwrap_or(DEFAULT_MEMORY_LEN)).await?;
        Ok::<MemoryData, ApiError>(MemoryData { address, data })
    }
    .await;
    respond("GET", "/cpu/:name/memory/:addr", timer, result)
}

async fn disassemble_handler(
    name: String,
    address: String,
    query: InsnsQuery,
    ctx: ServerContext,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let address = parse_address(&address)?;
        let cpu = lookup(&ctx, &name).await?;
        let count = query.count.unwrap_or(DEFAULT_INSN_COUNT);
        Ok::<Vec<Disassembly>, ApiError>(cpu.disassemble(address, count).await?)
    }
    .await;
    respond("GET", "/cpu/:name/memory/:addr/insns", timer, result)
}

async fn events_handler(name: String, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let cpu = lookup(&ctx, &name).await?;
        let events: BTreeMap<String, BreakpointKind> = cpu
            .breakpoints()
            .await?
            .into_iter()
            .map(|(address, kind)| (format!("{:04x}", address), kind))
            .collect();
        Ok::<_, ApiError>(events)
    }
    .await;
    respond("GET", "/cpu/:name/events", timer, result)
}

async fn event_handler(name: String, event: EventRequest, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let address = parse_address(&event.addr)?;
        let cpu = lookup(&ctx, &name).await?;
        match event.kind {
            Some(kind) => cpu.set_breakpoint(address, kind).await?,
            None => {
                cpu.clear_breakpoint(address).await?;
            }
        }
        Ok::<(), ApiError>(())
    }
    .await;
    respond("POST", "/cpu/:name/event", timer, result)
}

async fn control_handler(name: String, action: Action, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let cpu = lookup(&ctx, &name).await?;
        match action {
            Action::Boot => cpu.boot().await?,
            Action::Continue => cpu.continue_execution().await?,
            Action::Step => cpu.step().await?,
            Action::Stop => cpu.stop().await?,
            Action::Reset => cpu.reset().await?,
        }
        Ok::<CpuStatus, ApiError>(cpu.status().await?)
    }
    .await;

    let endpoint = match action {
        Action::Boot => "/cpu/:name/boot",
        Action::Continue => "/cpu/:name/continue",
        Action::Step => "/cpu/:name/step",
        Action::Stop => "/cpu/:name/stop",
        Action::Reset => "/cpu/:name/reset",
    };
    respond("POST", endpoint, timer, result)
}

async fn load_handler(name: String, request: LoadRequest, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let cpu = lookup(&ctx, &name).await?;
        Ok::<usize, ApiError>(cpu.load_image(&request.key).await?)
    }
    .await;
    respond("POST", "/cpu/:name/load", timer, result)
}

async fn input_handler(name: String, request: InputRequest, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        ctx.kv
            .set(&instance_key(&name, "input"), request.input.into_bytes())
            .await?;
        Ok::<(), ApiError>(())
    }
    .await;
    respond("POST", "/cpu/:name/input", timer, result)
}

async fn output_handler(name: String, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let raw = ctx.kv.get(&instance_key(&name, "output")).await?.unwrap_or_default();
        Ok::<String, ApiError>(String::from_utf8_lossy(&raw).into_owned())
    }
    .await;
    respond("GET", "/cpu/:name/output", timer, result)
}

async fn debug_log_handler(name: String, ctx: ServerContext) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let result = async {
        let entries = ctx.kv.lrange(&instance_key(&name, "debuglog"), 0, -1).await?;
        Ok::<Vec<String>, ApiError>(
            entries
                .iter()
                .map(|entry| String::from_utf8_lossy(entry).into_owned())
                .collect(),
        )
    }
    .await;
    respond("GET", "/cpu/:name/debuglog", timer, result)
}

async fn metrics_handler() -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => {
            record_api_request("GET", "/metrics", 200, timer.elapsed());
            Ok(warp::reply::with_header(
                metrics_text,
                "content-type",
                "text/plain; version=0.0.4",
            ))
        }
        Err(_) => {
            record_api_request("GET", "/metrics", 500, timer.elapsed());
            Ok(warp::reply::with_header(
                "Error encoding metrics".to_string(),
                "content-type",
                "text/plain",
            ))
        }
    }
}
