// A push-notification broadcaster: keeps the device tokens registered per
// mobile app on GCM, APNs and the APNs sandbox, and fans a message out to
// all of them, pruning tokens the providers report as dead.
mod apns;
mod authtoken;
mod config;
mod error;
mod fanout;
mod feedback;
mod gateway;
mod gcm;
mod models;
mod persistence;
mod routes;
mod store;
mod types;
mod util;
mod weblogs;

use actix_web::{HttpResponse, HttpServer, App, web::{self, Data}, error::InternalError};
use dotenv::dotenv;
use log::{info, error, warn};
use std::{sync::Arc, process::exit};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use apns::ApnsGateway;
use config::{EnvConfig, Settings};
use fanout::Broadcaster;
use feedback::{ApnsFeedback, Reconciler, RestartPolicy, Supervisor};
use gcm::GcmGateway;
use routes::{apps, broadcast, health, logs, register_apns, register_apns_sandbox, register_gcm,
    unregister_apns, unregister_apns_sandbox, unregister_gcm};
use store::Registry;
use types::Channel;
use weblogs::LogSink;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    let env = match EnvConfig::from_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("Bad environment: {e}");
            exit(1)
        }
    };
    util::init_logging(&env.log_config_path);

    let settings = match Settings::load(&env.config_path) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("{e}");
            exit(1)
        }
    };
    info!("{} apps configured", settings.apps.len());

    let sink = LogSink::new();

    if let Err(e) = std::fs::create_dir_all(&env.data_dir) {
        error!("Could not create data directory {}: {e}", env.data_dir.display());
        exit(1)
    }

    info!("Load the tokens from storage");
    let registry = Registry::load(&env.data_dir, sink.clone()).await;
    info!("Tokens loaded");

    let http_client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            error!("Could not build HTTP client: {e}");
            exit(1)
        }
    };
    let mut broadcaster = Broadcaster::new(registry.clone(), Arc::clone(&settings), sink.clone())
        .with_gateway(Arc::new(GcmGateway::new(http_client, env.gcm_endpoint.clone())));
    for channel in [Channel::Apns, Channel::ApnsSandbox] {
        match ApnsGateway::new(channel) {
            Ok(gateway) => broadcaster = broadcaster.with_gateway(Arc::new(gateway)),
            Err(e) => error!("{} gateway unavailable: {}", channel, e),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let policy = RestartPolicy::new(env.feedback_interval);
    let mut supervisors: Vec<JoinHandle<usize>> = Vec::new();
    for app in &settings.apps {
        for channel in [Channel::Apns, Channel::ApnsSandbox] {
            let Some(source) = app.apns_for(channel).and_then(|apns| ApnsFeedback::new(channel, apns)) else {
                continue;
            };
            let reconciler = Reconciler::new(
                app.name.clone(),
                registry.store(channel).clone(),
                Arc::new(source),
                sink.clone(),
            );
            let supervisor = Supervisor::new(reconciler, policy, shutdown_rx.clone());
            broadcaster = broadcaster.with_feedback_waker(channel, &app.name, supervisor.waker());
            supervisors.push(tokio::spawn(supervisor.run()));
        }
    }

    let registry_data = Data::new(registry);
    let settings_data = Data::from(settings);
    let broadcaster_data = Data::new(broadcaster);
    let sink_data = Data::new(sink);

    info!("Listening on {}:{}", env.host, env.port);
    let server_handle = HttpServer::new(move || {
        let form_cfg = web::FormConfig::default()
            .error_handler(|err, _req| {
                warn!("Form config error: {}", err);
                InternalError::from_response(err, HttpResponse::BadRequest().into()).into()
            });
        App::new()
            .app_data(Data::clone(&registry_data))
            .app_data(Data::clone(&settings_data))
            .app_data(Data::clone(&broadcaster_data))
            .app_data(Data::clone(&sink_data))
            .app_data(form_cfg)
            .service(register_gcm)
            .service(unregister_gcm)
            .service(register_apns)
            .service(unregister_apns)
            .service(register_apns_sandbox)
            .service(unregister_apns_sandbox)
            .service(broadcast)
            .service(apps)
            .service(logs)
            .service(health)
    })
        .bind((env.host.as_str(), env.port))?
        .run();

    let result = server_handle.await;

    shutdown_tx.send(true).ok();
    for supervisor in supervisors {
        if let Err(e) = supervisor.await {
            error!("Feedback supervisor panicked: {}", e);
        }
    }
    result
}
