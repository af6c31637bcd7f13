use std::collections::HashMap;
use std::convert::Infallible;

use actix_web::http::header::{AUTHORIZATION, CACHE_CONTROL, WWW_AUTHENTICATE};
use actix_web::web::{self, Bytes};
use actix_web::{get, post, HttpRequest, HttpResponse, Responder};
use base64::{engine::general_purpose, Engine};
use log::{debug, info, warn};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

use crate::config::Settings;
use crate::fanout::Broadcaster;
use crate::models::{AppInfo, BroadcastRequest, StatusResponse, TokenForm};
use crate::store::Registry;
use crate::types::Channel;
use crate::util::get_short_token;
use crate::weblogs::{LogSink, LogStream};

#[post("/gcm/register")]
pub async fn register_gcm(form: web::Form<TokenForm>, registry: web::Data<Registry>) -> impl Responder {
    register(Channel::Gcm, &form, &registry).await
}

#[post("/gcm/unregister")]
pub async fn unregister_gcm(form: web::Form<TokenForm>, registry: web::Data<Registry>) -> impl Responder {
    unregister(Channel::Gcm, &form, &registry).await
}

#[post("/apns/register")]
pub async fn register_apns(form: web::Form<TokenForm>, registry: web::Data<Registry>) -> impl Responder {
    register(Channel::Apns, &form, &registry).await
}

#[post("/apns/unregister")]
pub async fn unregister_apns(form: web::Form<TokenForm>, registry: web::Data<Registry>) -> impl Responder {
    unregister(Channel::Apns, &form, &registry).await
}

#[post("/apns/register_sandbox")]
pub async fn register_apns_sandbox(form: web::Form<TokenForm>, registry: web::Data<Registry>) -> impl Responder {
    register(Channel::ApnsSandbox, &form, &registry).await
}

#[post("/apns/unregister_sandbox")]
pub async fn unregister_apns_sandbox(form: web::Form<TokenForm>, registry: web::Data<Registry>) -> impl Responder {
    unregister(Channel::ApnsSandbox, &form, &registry).await
}

async fn register(channel: Channel, form: &TokenForm, registry: &Registry) -> HttpResponse {
    match form.validate() {
        Ok((app, token)) => {
            info!("Register {} token: ...{} for {}", channel, get_short_token(token), app);
            registry.add_token(channel, app, token).await;
            HttpResponse::Ok().json(StatusResponse::success("Token saved"))
        }
        Err(e) => {
            info!("Register {}: app or token empty", channel);
            HttpResponse::BadRequest().json(StatusResponse::error(e.to_string()))
        }
    }
}

async fn unregister(channel: Channel, form: &TokenForm, registry: &Registry) -> HttpResponse {
    match form.validate() {
        Ok((app, token)) => {
            info!("Unregister {} token: ...{} for {}", channel, get_short_token(token), app);
            registry.remove_token(channel, app, token).await;
            HttpResponse::Ok().json(StatusResponse::success("Token deleted"))
        }
        Err(e) => {
            info!("Unregister {}: app or token empty", channel);
            HttpResponse::BadRequest().json(StatusResponse::error(e.to_string()))
        }
    }
}

#[get("/broadcast")]
pub async fn broadcast(req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    settings: web::Data<Settings>,
    broadcaster: web::Data<Broadcaster>) -> impl Responder {

    if let Err(denied) = authorize(&req, &settings) {
        return denied;
    }

    match BroadcastRequest::from_params(query.into_inner()) {
        Ok(request) => {
            info!("Broadcast to {} on {:?}", request.app, request.channels.channels());
            broadcaster.trigger(request);
            HttpResponse::Ok().json(StatusResponse::success("Broadcast started"))
        }
        Err(e) => {
            warn!("Broadcast rejected: {}", e);
            HttpResponse::BadRequest().json(StatusResponse::error(e.to_string()))
        }
    }
}

#[get("/apps")]
pub async fn apps(req: HttpRequest,
    settings: web::Data<Settings>,
    registry: web::Data<Registry>) -> impl Responder {

    if let Err(denied) = authorize(&req, &settings) {
        return denied;
    }

    let mut infos = Vec::with_capacity(settings.apps.len());
    for app in &settings.apps {
        infos.push(AppInfo {
            name: app.name.clone(),
            android_devices: registry.count_tokens(Channel::Gcm, &app.name).await,
            ios_devices: registry.count_tokens(Channel::Apns, &app.name).await,
            ios_sandbox_devices: registry.count_tokens(Channel::ApnsSandbox, &app.name).await,
            fields: app.fields.clone(),
        });
    }
    HttpResponse::Ok().json(infos)
}

/// Server-sent events carrying the engine's progress lines.
#[get("/logs/{stream}")]
pub async fn logs(req: HttpRequest,
    stream: web::Path<String>,
    settings: web::Data<Settings>,
    sink: web::Data<LogSink>) -> impl Responder {

    if let Err(denied) = authorize(&req, &settings) {
        return denied;
    }
    let Some(log_stream) = LogStream::parse(&stream) else {
        return HttpResponse::NotFound().json(StatusResponse::error(format!("unknown log stream {stream}")));
    };

    let lines = BroadcastStream::new(sink.subscribe(log_stream)).filter_map(|line| match line {
        Ok(line) => Some(Ok::<_, Infallible>(Bytes::from(format!("data: {line}\n\n")))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            debug!("logs:: subscriber skipped {} lines", skipped);
            None
        }
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((CACHE_CONTROL, "no-cache"))
        .streaming(lines)
}

#[get("/health")]
pub async fn health() -> impl Responder {
    info!("Health check");
    HttpResponse::Ok()
}

fn authorize(req: &HttpRequest, settings: &Settings) -> Result<(), HttpResponse> {
    let header = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if check_basic_auth(header, settings) {
        return Ok(());
    }
    Err(HttpResponse::Unauthorized()
        .insert_header((WWW_AUTHENTICATE, "Basic realm=\"Authorization Required\""))
        .json(StatusResponse::error("authorization failed")))
}

/// Open access unless a login is configured.
fn check_basic_auth(header: Option<&str>, settings: &Settings) -> bool {
    if !settings.requires_auth() {
        return true;
    }
    let login = settings.login.as_deref().unwrap_or_default();
    let password = settings.password.as_deref().unwrap_or_default();

    let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    decoded.split_once(':') == Some((login, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::web::Data;
    use actix_web::{test, App};
    use serde_json::Value;

    use crate::config::AppSettings;

    fn locked_settings() -> Settings {
        Settings {
            login: Some("admin".into()),
            password: Some("secret".into()),
            apps: vec![AppSettings { name: "App1".into(), ..Default::default() }],
        }
    }

    fn basic(user_pass: &str) -> String {
        format!("Basic {}", general_purpose::STANDARD.encode(user_pass))
    }

    #[actix_web::test]
    async fn basic_auth_matches_login_and_password() {
        let settings = locked_settings();
        assert!(check_basic_auth(Some(basic("admin:secret").as_str()), &settings));
        assert!(!check_basic_auth(Some(basic("admin:wrong").as_str()), &settings));
        assert!(!check_basic_auth(Some("Bearer abc"), &settings));
        assert!(!check_basic_auth(None, &settings));
        assert!(check_basic_auth(None, &Settings::default()));
    }

    #[actix_web::test]
    async fn register_and_unregister_round_trip() {
        let registry = Registry::in_memory();
        let app = test::init_service(
            App::new()
                .app_data(Data::new(registry.clone()))
                .service(register_apns_sandbox)
                .service(unregister_apns_sandbox),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/apns/register_sandbox")
            .set_form([("app", "App1"), ("token", "abc")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Token saved");
        assert_eq!(registry.list_tokens(Channel::ApnsSandbox, "App1").await, vec!["abc"]);
        assert_eq!(registry.count_tokens(Channel::Apns, "App1").await, 0);

        let req = test::TestRequest::post()
            .uri("/apns/unregister_sandbox")
            .set_form([("app", "App1"), ("token", "abc")])
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["message"], "Token deleted");
        assert_eq!(registry.count_tokens(Channel::ApnsSandbox, "App1").await, 0);
    }

    #[actix_web::test]
    async fn register_without_token_is_rejected() {
        let registry = Registry::in_memory();
        let app = test::init_service(App::new().app_data(Data::new(registry.clone())).service(register_gcm)).await;

        let req = test::TestRequest::post().uri("/gcm/register").set_form([("app", "App1")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "app and token params are required");
        assert_eq!(registry.count_tokens(Channel::Gcm, "App1").await, 0);
    }

    #[actix_web::test]
    async fn apps_reports_counts_behind_auth() {
        let registry = Registry::in_memory();
        registry.add_token(Channel::Gcm, "App1", "g1").await;
        registry.add_token(Channel::Gcm, "App1", "g2").await;
        registry.add_token(Channel::Apns, "App1", "i1").await;
        let app = test::init_service(
            App::new()
                .app_data(Data::new(registry))
                .app_data(Data::new(locked_settings()))
                .service(apps),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/apps").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(WWW_AUTHENTICATE));

        let req = test::TestRequest::get()
            .uri("/apps")
            .insert_header((AUTHORIZATION, basic("admin:secret")))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body[0]["name"], "App1");
        assert_eq!(body[0]["androidDevices"], 2);
        assert_eq!(body[0]["iosDevices"], 1);
        assert_eq!(body[0]["iosSandboxDevices"], 0);
    }

    #[actix_web::test]
    async fn apps_is_open_without_a_login() {
        let settings = Settings {
            apps: vec![AppSettings { name: "App1".into(), ..Default::default() }],
            ..Default::default()
        };
        let app = test::init_service(
            App::new()
                .app_data(Data::new(Registry::in_memory()))
                .app_data(Data::new(settings))
                .service(apps),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/apps").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn broadcast_validates_before_triggering() {
        let registry = Registry::in_memory();
        let settings = Arc::new(Settings::default());
        let broadcaster = Broadcaster::new(registry.clone(), Arc::clone(&settings), LogSink::new());
        let app = test::init_service(
            App::new()
                .app_data(Data::from(settings))
                .app_data(Data::new(broadcaster))
                .service(broadcast),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/broadcast?GCM=true").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/broadcast?app=NoSuchApp&message=hi&GCM=true").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
    }

    #[actix_web::test]
    async fn unknown_log_stream_is_not_found() {
        let app = test::init_service(
            App::new()
                .app_data(Data::new(Settings::default()))
                .app_data(Data::new(LogSink::new()))
                .service(logs),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/logs/sms").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/logs/gcm").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
