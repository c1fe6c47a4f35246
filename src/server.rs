use crate::app_state::{AppState, ServerConfig};
use crate::error::ApiError;
use crate::input::{decode_upload, shape_for_task, value_to_input};
use crate::io_struct::{InferForm, InferResponse, SupportedTasksResponse};
use crate::pipelines::Task;
use actix_multipart::Multipart;
use actix_web::{HttpResponse, HttpServer, get, post, web};
use serde_json::json;
use std::io::Write;

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "OK"}))
}

#[post("/infer")]
pub async fn infer(
    payload: Multipart,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let form = InferForm::from_multipart(payload).await?;
    let model_name = form
        .model_name
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Field 'model_name' is required".to_string()))?;
    if !form.has_inputs() && form.file.is_none() {
        return Err(ApiError::BadRequest(
            "Either 'inputs' or 'file' must be provided".to_string(),
        ));
    }
    let parameters = form.parsed_parameters()?;

    let pipeline = app_state
        .resolve_pipeline(&model_name, form.task.as_deref())
        .await?;
    let task = pipeline.task();

    // An uploaded file takes precedence over the inputs field.
    let input = if let Some(file) = &form.file {
        decode_upload(file.content_type.as_deref(), &file.data)?
    } else {
        match form.parsed_inputs() {
            Some(value) => value_to_input(value),
            None => {
                return Err(ApiError::BadRequest(
                    "Either 'inputs' or 'file' must be provided".to_string(),
                ));
            }
        }
    };
    let input = shape_for_task(input, task);

    let result = web::block(move || pipeline.run(input, &parameters))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Inference(e.to_string()))?;

    Ok(HttpResponse::Ok().json(InferResponse {
        model: model_name,
        task: task.to_string(),
        result,
    }))
}

#[get("/supported_tasks")]
pub async fn supported_tasks() -> HttpResponse {
    HttpResponse::Ok().json(SupportedTasksResponse {
        supported_tasks: Task::ALL.iter().map(|t| t.as_str().to_string()).collect(),
        message: "Note: Custom models may support additional tasks".to_string(),
    })
}

pub fn service_config(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(infer).service(supported_tasks);
}

pub async fn startup(config: ServerConfig, app_state: AppState) -> std::io::Result<()> {
    let app_state = web::Data::new(app_state);

    println!("Starting server at {}:{}", config.host, config.port);

    // default level is info
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .configure(service_config)
    })
    .bind((config.host, config.port))?
    .run()
    .await?;

    std::io::Result::Ok(())
}
