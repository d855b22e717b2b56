use std::error::Error;

/// Coerces a concrete error into `&dyn Error` for use in a `tracing` field
/// (e.g. `error = std_dyn_err(&e)`), which `tracing`'s `%`/`?` sigils can't
/// do on their own across a trait object boundary.
pub fn std_dyn_err(e: &(impl Error + 'static)) -> &(dyn Error + 'static) {
    e as &(dyn Error + 'static)
}

pub fn anyhow_dyn_err(e: &anyhow::Error) -> &(dyn Error + 'static) {
    e.as_ref()
}
