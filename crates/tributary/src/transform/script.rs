//! Embedded ECMAScript transformation
//!
//! The script source must either evaluate to a callable (an anonymous
//! function expression at top level) or define a global named `transform`.
//! Validation executes the source once in a throwaway runtime at load time.
//!
//! Every event gets a fresh engine context: scripts cannot leak state across
//! events, and the host bindings (`console`, `nats`) are reinstalled each
//! time. The event crosses the boundary as JSON in both directions; the full
//! returned serialization rides along as the event's opaque tail so fields a
//! script adds survive to the sink verbatim.
//!
//! A `null` or `undefined` return rejects the event. Script exceptions abort
//! the current event only.

use crate::common::{CdcError, ChangeEvent, EventType, Result, Row};
use crate::sink::ScriptBus;
use boa_engine::{
    js_string,
    object::{builtins::JsUint8Array, ObjectInitializer},
    property::Attribute,
    Context, JsError, JsNativeError, JsObject, JsResult, JsValue, NativeFunction, Source,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Script-based transformer. Holds the validated source; runtimes are
/// created per event.
pub struct ScriptTransformer {
    source: String,
    bus: Option<Arc<dyn ScriptBus>>,
}

impl std::fmt::Debug for ScriptTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptTransformer")
            .field("source", &self.source)
            .field("bus", &self.bus.as_ref().map(|_| "<ScriptBus>"))
            .finish()
    }
}

impl ScriptTransformer {
    /// Read and validate a script file.
    pub fn load(path: &Path, bus: Option<Arc<dyn ScriptBus>>) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            CdcError::config(format!(
                "failed to read transform script {}: {e}",
                path.display()
            ))
        })?;
        let transformer = Self::from_source(source, bus)?;
        info!("Loaded transform script {}", path.display());
        Ok(transformer)
    }

    /// Validate a script source: it must evaluate to a callable or define a
    /// global `transform` function.
    pub fn from_source(source: String, bus: Option<Arc<dyn ScriptBus>>) -> Result<Self> {
        let mut context = Context::default();
        let result = context
            .eval(Source::from_bytes(source.as_bytes()))
            .map_err(|e| CdcError::config(format!("transform script failed to execute: {e}")))?;

        if resolve_callable(&result, &mut context)?.is_none() {
            return Err(CdcError::config(
                "transform script must evaluate to a function or define a global `transform` function",
            ));
        }

        Ok(Self { source, bus })
    }

    /// Run the script against one event. `Ok(None)` = rejected.
    pub fn transform(&self, event: &ChangeEvent) -> Result<Option<ChangeEvent>> {
        let payload = serde_json::to_value(event)?;

        debug!(
            "Transforming {} event for {}.{} with script",
            event.event_type, event.database, event.table
        );

        let mut context = Context::default();
        install_console(&mut context)?;
        if let Some(bus) = &self.bus {
            install_nats(&mut context, bus.clone())?;
        }

        let script_result = context
            .eval(Source::from_bytes(self.source.as_bytes()))
            .map_err(script_error)?;

        let function = resolve_callable(&script_result, &mut context)?
            .ok_or_else(|| CdcError::transform("transform script lost its function shape"))?;

        let argument = JsValue::from_json(&payload, &mut context).map_err(script_error)?;
        let result = function
            .call(&JsValue::undefined(), &[argument], &mut context)
            .map_err(|e| {
                error!("Transform script error: {e}");
                script_error(e)
            })?;

        if result.is_null_or_undefined() {
            info!(
                "Event rejected by transform script: {}.{} ({})",
                event.database, event.table, event.event_type
            );
            return Ok(None);
        }

        let result_json = result.to_json(&mut context).map_err(script_error)?;
        let raw = serde_json::to_vec(&result_json)?;

        let mut transformed = event_from_json(&result_json, event);
        transformed.raw = Some(raw);
        Ok(Some(transformed))
    }
}

/// The callable shape: the eval result itself, else the global `transform`.
fn resolve_callable(eval_result: &JsValue, context: &mut Context) -> Result<Option<JsObject>> {
    if let Some(function) = eval_result.as_callable() {
        return Ok(Some(function.clone()));
    }

    let global = context.global_object();
    let transform = global
        .get(js_string!("transform"), context)
        .map_err(script_error)?;
    Ok(transform.as_callable().cloned())
}

/// Rebuild the canonical fields from the script's return value; anything
/// missing falls back to the input event.
fn event_from_json(json: &serde_json::Value, original: &ChangeEvent) -> ChangeEvent {
    let event_type = json
        .get("type")
        .and_then(|v| v.as_str())
        .and_then(EventType::parse)
        .unwrap_or(original.event_type);
    let database = json
        .get("database")
        .and_then(|v| v.as_str())
        .unwrap_or(&original.database)
        .to_string();
    let table = json
        .get("table")
        .and_then(|v| v.as_str())
        .unwrap_or(&original.table)
        .to_string();
    let timestamp = json
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .unwrap_or(original.timestamp);

    ChangeEvent {
        event_type,
        database,
        table,
        timestamp,
        rows: json_rows(json.get("rows")),
        old_rows: json_rows(json.get("old_rows")),
        raw: None,
    }
}

fn json_rows(value: Option<&serde_json::Value>) -> Vec<Row> {
    value
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn script_error(e: JsError) -> CdcError {
    CdcError::transform(e.to_string())
}

fn type_error(msg: impl Into<String>) -> JsError {
    JsNativeError::typ().with_message(msg.into()).into()
}

fn host_error(msg: impl Into<String>) -> JsError {
    JsNativeError::error().with_message(msg.into()).into()
}

// ---------------------------------------------------------------------------
// console binding

fn format_console_args(args: &[JsValue]) -> String {
    args.iter()
        .map(|arg| arg.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn console_log(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    info!(target: "transform_script", "{}", format_console_args(args));
    Ok(JsValue::undefined())
}

fn console_info(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    info!(target: "transform_script", "{}", format_console_args(args));
    Ok(JsValue::undefined())
}

fn console_warn(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    warn!(target: "transform_script", "{}", format_console_args(args));
    Ok(JsValue::undefined())
}

fn console_error(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    error!(target: "transform_script", "{}", format_console_args(args));
    Ok(JsValue::undefined())
}

fn console_debug(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    debug!(target: "transform_script", "{}", format_console_args(args));
    Ok(JsValue::undefined())
}

fn install_console(context: &mut Context) -> Result<()> {
    let console = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(console_log), js_string!("log"), 1)
        .function(NativeFunction::from_fn_ptr(console_info), js_string!("info"), 1)
        .function(NativeFunction::from_fn_ptr(console_warn), js_string!("warn"), 1)
        .function(NativeFunction::from_fn_ptr(console_error), js_string!("error"), 1)
        .function(NativeFunction::from_fn_ptr(console_debug), js_string!("debug"), 1)
        .build();

    context
        .register_global_property(js_string!("console"), console, Attribute::all())
        .map_err(script_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// nats binding

fn string_arg(args: &[JsValue], idx: usize, function: &str, name: &str) -> JsResult<String> {
    match args.get(idx).and_then(JsValue::as_string) {
        Some(s) if !s.is_empty() => Ok(s.to_std_string_escaped()),
        _ => Err(type_error(format!("{function}: {name} is required"))),
    }
}

/// Payload conversion: strings pass through, byte arrays stay bytes,
/// everything else is JSON-encoded.
fn value_to_payload(value: &JsValue, context: &mut Context) -> JsResult<Vec<u8>> {
    if let Some(s) = value.as_string() {
        return Ok(s.to_std_string_escaped().into_bytes());
    }

    if let Some(object) = value.as_object() {
        if JsUint8Array::from_object(object.clone()).is_ok() {
            let len = object.get(js_string!("length"), context)?.to_length(context)? as usize;
            let mut bytes = Vec::with_capacity(len);
            for i in 0..len {
                bytes.push(object.get(i, context)?.to_uint8(context)?);
            }
            return Ok(bytes);
        }
    }

    let json = value.to_json(context)?;
    serde_json::to_vec(&json).map_err(|e| type_error(format!("failed to encode payload: {e}")))
}

fn install_nats(context: &mut Context, bus: Arc<dyn ScriptBus>) -> Result<()> {
    let publish = {
        let bus = bus.clone();
        // SAFETY: the closure captures only an Arc to host state, no
        // engine-managed values.
        unsafe {
            NativeFunction::from_closure(move |_this, args, ctx| {
                let subject = string_arg(args, 0, "nats.publish", "subject")?;
                let data = args.get(1).cloned().unwrap_or_default();
                if data.is_null_or_undefined() {
                    return Err(type_error("nats.publish: data is required"));
                }
                let payload = value_to_payload(&data, ctx)?;
                bus.publish(&subject, &payload)
                    .map_err(|e| host_error(format!("nats.publish: {e}")))?;
                Ok(JsValue::undefined())
            })
        }
    };

    let kv_get = {
        let bus = bus.clone();
        // SAFETY: as above.
        unsafe {
            NativeFunction::from_closure(move |_this, args, _ctx| {
                let bucket = string_arg(args, 0, "nats.kv.get", "bucket")?;
                let key = string_arg(args, 1, "nats.kv.get", "key")?;
                match bus
                    .kv_get(&bucket, &key)
                    .map_err(|e| host_error(format!("nats.kv.get: {e}")))?
                {
                    Some(value) => Ok(boa_engine::JsString::from(value.as_str()).into()),
                    None => Ok(JsValue::null()),
                }
            })
        }
    };

    let kv_put = {
        let bus = bus.clone();
        // SAFETY: as above.
        unsafe {
            NativeFunction::from_closure(move |_this, args, ctx| {
                let bucket = string_arg(args, 0, "nats.kv.put", "bucket")?;
                let key = string_arg(args, 1, "nats.kv.put", "key")?;
                let value = args.get(2).cloned().unwrap_or_default();
                if value.is_null_or_undefined() {
                    return Err(type_error("nats.kv.put: value is required"));
                }
                let payload = value_to_payload(&value, ctx)?;
                bus.kv_put(&bucket, &key, &payload)
                    .map_err(|e| host_error(format!("nats.kv.put: {e}")))?;
                Ok(JsValue::undefined())
            })
        }
    };

    let kv_delete = {
        let bus = bus.clone();
        // SAFETY: as above.
        unsafe {
            NativeFunction::from_closure(move |_this, args, _ctx| {
                let bucket = string_arg(args, 0, "nats.kv.delete", "bucket")?;
                let key = string_arg(args, 1, "nats.kv.delete", "key")?;
                bus.kv_delete(&bucket, &key)
                    .map_err(|e| host_error(format!("nats.kv.delete: {e}")))?;
                Ok(JsValue::undefined())
            })
        }
    };

    let kv = ObjectInitializer::new(context)
        .function(kv_get, js_string!("get"), 2)
        .function(kv_put, js_string!("put"), 3)
        .function(kv_delete, js_string!("delete"), 2)
        .build();

    let nats = ObjectInitializer::new(context)
        .function(publish, js_string!("publish"), 2)
        .property(js_string!("kv"), kv, Attribute::all())
        .build();

    context
        .register_global_property(js_string!("nats"), nats, Attribute::all())
        .map_err(script_error)?;
    Ok(())
}
