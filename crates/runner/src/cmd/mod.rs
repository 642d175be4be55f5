mod reconcile;
mod run;

pub use reconcile::{ReconcileArgs, run_reconcile};
pub use run::{RunArgs, run_sandbox};
