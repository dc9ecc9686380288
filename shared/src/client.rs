use std::time::Duration;

use tracing::info;

use crate::{
    backend::{Backend, Outcome, Workload},
    error::Result,
    param::{ParamIndex as P, ParamTable, Side},
    session::{Context, Session},
};

/// Seconds a measured test runs unless told otherwise or given a message
/// limit.
pub const DEFAULT_TIME: u32 = 2;
/// Seconds a message may take before the session gives up.
pub const DEFAULT_TIMEOUT: u32 = 5;

/// Runs one workload against the server at `host:port`.
///
/// The parameter table is prepared for the workload, the two requests are
/// derived from it, and the workload's client side runs over a fresh
/// session. A failure is passed on to the server before it is returned.
pub fn run_test(
    host: &str,
    port: u16,
    wait: Duration,
    params: &mut ParamTable,
    workload: Workload,
    context: Context,
) -> Result<Outcome> {
    let mut backend = prepare(params, workload);

    let local = params.request(Side::Local, workload.selector());
    let remote = params.request(Side::Remote, workload.selector());

    let mut sess = Session::connect(host, port, wait, context)?;
    info!("running {workload} against {}", sess.peer_addr());

    let result = sess
        .send_request(local, &remote)
        .and_then(|()| backend.client(&mut sess));
    if let Err(e) = &result {
        sess.notify_failure(e);
    }
    sess.close();
    result
}

/// Applies the runner's defaults and the workload's own to `params`, and
/// warns about options the workload ignores.
fn prepare(params: &mut ParamTable, workload: Workload) -> Box<dyn Backend> {
    params.begin_test();
    let backend = workload.backend();
    // a message limit replaces the time limit unless both were given
    if !params.is_set(P::LNoMsgs) {
        params.set_default(P::LTime, DEFAULT_TIME);
    }
    if !params.is_set(P::RNoMsgs) {
        params.set_default(P::RTime, DEFAULT_TIME);
    }
    params.set_default_pair(P::LTimeout, P::RTimeout, DEFAULT_TIMEOUT);
    params.mark_used_pair(P::LTimeout, P::RTimeout);
    backend.configure(params);
    params.check_unused(workload.name());
    backend
}
