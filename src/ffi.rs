//! C-compatible FFI for coupling to an external primal/adjoint solver.
//!
//! All functions are `#[no_mangle] extern "C"`.  The host solver creates a
//! driver handle once, then per design cycle passes its objective,
//! constraints and sensitivities to `oneshot_step` and reads back the next
//! design with `oneshot_design`.
//!
//! Memory convention:
//!   - Caller allocates flat arrays and passes pointers + lengths.
//!   - Opaque handles (`*mut OneShotHandle`) are created by Rust and freed
//!     by Rust via `oneshot_free`.
//!   - Strings returned by Rust (`oneshot_snapshot_json`) are freed with
//!     `oneshot_string_free`.
//!   - Functions returning `i32` use 0 for success and -1 for failure; the
//!     message is available from `oneshot_last_error` on the same thread.

use crate::optimizer::{DriverSnapshot, OneShotDriver};
use crate::settings::DriverConfig;
use crate::types::{Evaluation, OneShotError, OneShotTerms, Result};
use ndarray::Array1;
use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::slice;

thread_local! {
    static LAST_ERROR: RefCell<String> = RefCell::new(String::new());
}

fn set_last_error(e: &OneShotError) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = e.to_string());
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().clear());
}

fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

fn null_error(what: &str) -> OneShotError {
    OneShotError::Shape(format!("null pointer passed for {what}"))
}

/// Read a caller string; null means "not given".
unsafe fn optional_str<'a>(s: *const c_char) -> Result<Option<&'a str>> {
    if s.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(s)
        .to_str()
        .map(Some)
        .map_err(|e| OneShotError::Config(format!("string is not valid UTF-8: {e}")))
}

// ─────────────────────────────────────────────────────────────
//  Opaque handle
// ─────────────────────────────────────────────────────────────

/// Driver handle that owns the optimizer and the one-shot state vectors
/// for the next step.
pub struct OneShotHandle {
    pub driver: OneShotDriver,
    pub terms: Option<OneShotTerms>,
}

/// Create a driver for `n` design variables.
///
/// `config_toml` may be null for the default configuration.  Returns null
/// on failure.
///
/// # Safety
/// `initial_design` must be valid for `n` reads; `config_toml` must be null
/// or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn oneshot_create(
    n: usize,
    initial_design: *const f64,
    config_toml: *const c_char,
) -> *mut OneShotHandle {
    let build = || -> Result<OneShotHandle> {
        if initial_design.is_null() {
            return Err(null_error("initial_design"));
        }
        let config = match optional_str(config_toml)? {
            Some(text) => DriverConfig::from_toml_str(text)?,
            None => DriverConfig::default(),
        };
        let design = Array1::from(slice::from_raw_parts(initial_design, n).to_vec());
        let driver = OneShotDriver::new(design, config)?;
        Ok(OneShotHandle { driver, terms: None })
    };
    match build() {
        Ok(handle) => {
            clear_last_error();
            Box::into_raw(Box::new(handle))
        }
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Free a handle.  Null is ignored.
///
/// # Safety
/// `handle` must come from `oneshot_create` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn oneshot_free(handle: *mut OneShotHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Set the primal/adjoint iterates used by the Lagrangian penalty terms of
/// subsequent steps.  Passing `len == 0` clears them.
///
/// # Safety
/// Valid handle; the four arrays must be valid for `len` reads.
#[no_mangle]
pub unsafe extern "C" fn oneshot_set_state(
    handle: *mut OneShotHandle,
    state: *const f64,
    state_store: *const f64,
    adjoint: *const f64,
    adjoint_store: *const f64,
    len: usize,
) -> i32 {
    let run = || -> Result<()> {
        let h = handle.as_mut().ok_or_else(|| null_error("handle"))?;
        if len == 0 {
            h.terms = None;
            return Ok(());
        }
        if state.is_null() || state_store.is_null() || adjoint.is_null() || adjoint_store.is_null() {
            return Err(null_error("state vectors"));
        }
        let read = |p: *const f64| Array1::from(slice::from_raw_parts(p, len).to_vec());
        h.terms = Some(OneShotTerms {
            state: read(state),
            state_store: read(state_store),
            adjoint: read(adjoint),
            adjoint_store: read(adjoint_store),
        });
        Ok(())
    };
    status(run())
}

/// Process one evaluation of the current design.
///
/// `constraint_gradients` is `num_constraints × n` row-major and may be
/// null when `num_constraints == 0`.  On success `out_accepted` tells
/// whether the evaluated design was accepted and `out_lagrangian` holds its
/// Lagrangian value.
///
/// # Safety
/// Valid handle; arrays sized as described; output pointers valid.
#[no_mangle]
pub unsafe extern "C" fn oneshot_step(
    handle: *mut OneShotHandle,
    objective: f64,
    constraints: *const f64,
    num_constraints: usize,
    objective_gradient: *const f64,
    constraint_gradients: *const f64,
    out_accepted: *mut bool,
    out_lagrangian: *mut f64,
) -> i32 {
    let run = || -> Result<()> {
        let h = handle.as_mut().ok_or_else(|| null_error("handle"))?;
        if objective_gradient.is_null() || out_accepted.is_null() || out_lagrangian.is_null() {
            return Err(null_error("objective_gradient or outputs"));
        }
        let n = h.driver.dim();
        let (values, gradients) = if num_constraints == 0 {
            (Vec::new(), Vec::new())
        } else {
            if constraints.is_null() || constraint_gradients.is_null() {
                return Err(null_error("constraints"));
            }
            let len = num_constraints
                .checked_mul(n)
                .filter(|&len| len <= isize::MAX as usize / std::mem::size_of::<f64>())
                .ok_or_else(|| OneShotError::Shape(format!("{num_constraints} constraint gradients of length {n} overflow")))?;
            let values = slice::from_raw_parts(constraints, num_constraints).to_vec();
            let flat = slice::from_raw_parts(constraint_gradients, len);
            let gradients = flat.chunks(n).map(|row| Array1::from(row.to_vec())).collect();
            (values, gradients)
        };
        let eval = Evaluation {
            objective,
            constraints: values,
            objective_gradient: Array1::from(slice::from_raw_parts(objective_gradient, n).to_vec()),
            constraint_gradients: gradients,
            penalty_gradient: None,
            one_shot: h.terms.clone(),
        };
        let outcome = h.driver.step(&eval)?;
        *out_accepted = outcome.accepted;
        *out_lagrangian = outcome.lagrangian;
        Ok(())
    };
    status(run())
}

/// Copy the design to evaluate next into `out` (length `n`).
///
/// # Safety
/// Valid handle; `out` valid for `n` writes.
#[no_mangle]
pub unsafe extern "C" fn oneshot_design(handle: *mut OneShotHandle, out: *mut f64, n: usize) -> i32 {
    let run = || -> Result<()> {
        let h = handle.as_ref().ok_or_else(|| null_error("handle"))?;
        if out.is_null() {
            return Err(null_error("out"));
        }
        let design = h.driver.design();
        if n != design.len() {
            return Err(OneShotError::Shape(format!(
                "output buffer has length {n}, design has {}",
                design.len()
            )));
        }
        let dst = slice::from_raw_parts_mut(out, n);
        for (d, &v) in dst.iter_mut().zip(design.iter()) {
            *d = v;
        }
        Ok(())
    };
    status(run())
}

/// Serialize the optimizer state to JSON.  Returns null on failure; free
/// the result with `oneshot_string_free`.
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn oneshot_snapshot_json(handle: *const OneShotHandle) -> *mut c_char {
    let run = || -> Result<CString> {
        let h = handle.as_ref().ok_or_else(|| null_error("handle"))?;
        let json = h.driver.snapshot().to_json()?;
        CString::new(json).map_err(|e| OneShotError::Shape(e.to_string()))
    };
    match run() {
        Ok(s) => {
            clear_last_error();
            s.into_raw()
        }
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Restore the optimizer state from JSON produced by
/// `oneshot_snapshot_json`.
///
/// # Safety
/// Valid handle; `json` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn oneshot_restore_json(handle: *mut OneShotHandle, json: *const c_char) -> i32 {
    let run = || -> Result<()> {
        let h = handle.as_mut().ok_or_else(|| null_error("handle"))?;
        let text = optional_str(json)?.ok_or_else(|| null_error("json"))?;
        let snapshot = DriverSnapshot::from_json(text)?;
        h.driver.restore(snapshot)
    };
    status(run())
}

/// Free a string returned by this library.  Null is ignored.
///
/// # Safety
/// `s` must come from this library and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn oneshot_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Copy the last error message of this thread into `buf` (not
/// NUL-terminated).  Returns the number of bytes written, 0 if there is no
/// error.
///
/// # Safety
/// `buf` must be valid for `len` writes.
#[no_mangle]
pub unsafe extern "C" fn oneshot_last_error(buf: *mut u8, len: usize) -> i32 {
    if buf.is_null() {
        return 0;
    }
    LAST_ERROR.with(|slot| {
        let msg = slot.borrow();
        let bytes = msg.as_bytes();
        let count = bytes.len().min(len);
        ptr::copy_nonoverlapping(bytes.as_ptr(), buf, count);
        count as i32
    })
}
