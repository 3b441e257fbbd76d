use actix_web::{http::StatusCode, HttpResponse};

#[derive(Debug)]
pub struct ServiceError {
    err: anyhow::Error,
    pub code: u16,
}

impl ServiceError {
    pub fn message(&self) -> String {
        self.err.to_string()
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ServiceError: {}", self.err)
    }
}

impl actix_web::error::ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).body(self.message())
    }
}

impl<E: Into<anyhow::Error>> From<E> for ServiceError {
    fn from(err: E) -> ServiceError {
        ServiceError {
            err: err.into(),
            code: 500,
        }
    }
}

pub trait AddCode {
    fn code(self, code: u16) -> ServiceError;
}

impl<E: Into<anyhow::Error>> AddCode for E {
    fn code(self, code: u16) -> ServiceError {
        ServiceError {
            err: self.into(),
            code,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
