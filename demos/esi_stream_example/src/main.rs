use fastly::{http::StatusCode, Request, Response};
use log::{error, info};
use streaming_esi::{Configuration, CustomVariables, Processor, SurrogateDelegation};

const ORIGIN: &str = "origin_0";

fn main() {
    env_logger::builder()
        .filter(None, log::LevelFilter::Trace)
        .init();

    let mut req = Request::from_client();

    // Delegation decisions are made on this header.
    if let Some(ip) = req.get_client_ip_addr() {
        req.set_header("Fastly-Client-IP", ip.to_string());
    }

    let config = Configuration::default()
        .with_recursion_limit(5)
        .with_third_party_includes_disabled(true)
        .with_vars_cookie_blacklist(["session"])
        .with_surrogate_delegation(SurrogateDelegation::Disabled);

    let processor = Processor::new(config).with_custom_variables(|_req| {
        CustomVariables::from([(
            "FASTLY_POP",
            std::env::var("FASTLY_POP").unwrap_or_default(),
        )])
    });

    let (bereq, ctx) = processor.prepare_request(req);

    let beresp = match bereq.send(ORIGIN) {
        Ok(beresp) => beresp,
        Err(err) => {
            error!("origin request failed: {err}");
            Response::from_status(StatusCode::BAD_GATEWAY).send_to_client();
            return;
        }
    };

    let result = processor.process_response(
        &ctx,
        beresp,
        Some(&|req| {
            info!("Sending request {} {}", req.get_method(), req.get_path());
            Ok(req.with_ttl(120).send_async(ORIGIN)?.into())
        }),
    );

    if let Err(err) = result {
        error!("error processing ESI document: {err}");
    }
}
