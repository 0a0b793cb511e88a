//! Web front end: the HTTP+JWS boundary.
//!
//! Handlers parse and authenticate the flattened-JWS body, resolve the
//! signer to a registration where the endpoint requires one, route into
//! the registration authority, and render the response with its
//! `Location`/`Link` headers. Errors become `application/problem+json`
//! documents; the business rules themselves live in [`crate::ra`].

use std::sync::Arc;

use actix_web::{
    http::{header, Method, StatusCode},
    web, HttpRequest, HttpResponse,
};
use serde::de::DeserializeOwned;

use crate::{
    api::{Authorization, CertificateRequest, ChallengeResponse, Registration},
    error::{Error, Result},
    jws,
    ra::{IssuanceRequest, RegistrationAuthority},
    sa::StorageAuthority,
    util,
};

pub const NEW_REG_PATH: &str = "/acme/new-reg";
pub const REG_PATH: &str = "/acme/reg/";
pub const NEW_AUTHZ_PATH: &str = "/acme/new-authz";
pub const AUTHZ_PATH: &str = "/acme/authz/";
pub const NEW_CERT_PATH: &str = "/acme/new-cert";
pub const CERT_PATH: &str = "/acme/cert/";
pub const ISSUER_CERT_PATH: &str = "/acme/issuer-cert";

const MAX_REQUEST_BODY: usize = 1 << 20;

pub struct WebFrontEnd {
    pub ra: Arc<dyn RegistrationAuthority>,
    pub sa: Arc<dyn StorageAuthority>,
    /// Prefix for absolute URLs in headers and bodies; may be empty, in
    /// which case URLs are origin-relative.
    pub base_url: String,
}

impl WebFrontEnd {
    fn url_for(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Route table. The returned closure plugs into `App::new().configure(..)`.
pub fn configure(wfe: Arc<WebFrontEnd>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::from(wfe))
            .app_data(web::PayloadConfig::new(MAX_REQUEST_BODY))
            .route("/", web::get().to(index))
            .route(NEW_REG_PATH, web::route().to(new_registration))
            .route("/acme/reg/{id}", web::route().to(registration))
            .route(NEW_AUTHZ_PATH, web::route().to(new_authorization))
            .route("/acme/authz/{id}", web::route().to(authorization))
            .route(NEW_CERT_PATH, web::route().to(new_certificate))
            .route("/acme/cert/{serial}", web::route().to(certificate));
    }
}

fn problem_response(err: &Error) -> HttpResponse {
    let status = match err {
        Error::Malformed(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized(_) => StatusCode::FORBIDDEN,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond_problem(status, err)
}

fn respond_problem(status: StatusCode, err: &Error) -> HttpResponse {
    HttpResponse::build(status)
        .content_type("application/problem+json")
        .body(serde_json::to_string(&err.problem()).unwrap_or_default())
}

fn method_not_allowed() -> HttpResponse {
    respond_problem(
        StatusCode::METHOD_NOT_ALLOWED,
        &Error::malformed("Method not allowed"),
    )
}

fn parse_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|_| Error::malformed("Error unmarshaling JSON"))
}

/// Signer resolution for endpoints that act on an existing registration.
fn registration_by_key(wfe: &WebFrontEnd, key: &jws::Jwk) -> Result<Registration> {
    wfe.sa
        .get_registration_by_key(key)?
        .ok_or_else(|| Error::unauthorized("No registration exists matching provided key"))
}

async fn index(wfe: web::Data<WebFrontEnd>) -> HttpResponse {
    let new_reg = wfe.url_for(NEW_REG_PATH);
    HttpResponse::Ok().content_type("text/html").body(format!(
        "<html><body>This is an ACME Certificate Authority.\n\
         New registrations go to <a href=\"{new_reg}\">{new_reg}</a>.</body></html>"
    ))
}

async fn new_registration(
    wfe: web::Data<WebFrontEnd>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    handle_new_registration(&wfe, &body).unwrap_or_else(|err| problem_response(&err))
}

fn handle_new_registration(wfe: &WebFrontEnd, body: &[u8]) -> Result<HttpResponse> {
    let verified = jws::verify_jws(body)?;

    if wfe.sa.get_registration_by_key(&verified.key)?.is_some() {
        return Err(Error::malformed("Registration key is already in use"));
    }

    let mut input: Registration = parse_payload(&verified.payload)?;
    // the authenticated signer key is the account key, whatever the
    // payload claims
    input.key = Some(verified.key);

    let registration = wfe.ra.new_registration(input)?;

    Ok(HttpResponse::Created()
        .insert_header((
            header::LOCATION,
            format!("{}{}", wfe.url_for(REG_PATH), registration.id),
        ))
        .insert_header((
            header::LINK,
            format!("<{}>;rel=\"next\"", wfe.url_for(NEW_AUTHZ_PATH)),
        ))
        .json(registration))
}

async fn registration(
    wfe: web::Data<WebFrontEnd>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    handle_registration(&wfe, &path, &body).unwrap_or_else(|err| problem_response(&err))
}

fn handle_registration(wfe: &WebFrontEnd, id: &str, body: &[u8]) -> Result<HttpResponse> {
    let verified = jws::verify_jws(body)?;
    let base = registration_by_key(wfe, &verified.key)?;

    let id: i64 = id
        .parse()
        .map_err(|_| Error::malformed("Invalid registration ID"))?;
    if id != base.id {
        return Err(Error::unauthorized("Registration ID did not match key"));
    }

    let updates: Registration = parse_payload(&verified.payload)?;
    let updated = wfe.ra.update_registration(base, updates)?;

    Ok(HttpResponse::Ok().json(updated))
}

async fn new_authorization(
    wfe: web::Data<WebFrontEnd>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    handle_new_authorization(&wfe, &body).unwrap_or_else(|err| problem_response(&err))
}

fn handle_new_authorization(wfe: &WebFrontEnd, body: &[u8]) -> Result<HttpResponse> {
    let verified = jws::verify_jws(body)?;
    let registration = registration_by_key(wfe, &verified.key)?;

    let request: Authorization = parse_payload(&verified.payload)?;
    let authz = wfe.ra.new_authorization(request, registration.id)?;

    Ok(HttpResponse::Created()
        .insert_header((
            header::LOCATION,
            format!("{}{}", wfe.url_for(AUTHZ_PATH), authz.id),
        ))
        .insert_header((
            header::LINK,
            format!("<{}>;rel=\"next\"", wfe.url_for(NEW_CERT_PATH)),
        ))
        .json(authz))
}

async fn authorization(
    wfe: web::Data<WebFrontEnd>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    handle_authorization(&wfe, &path, &req, &body).unwrap_or_else(|err| problem_response(&err))
}

fn handle_authorization(
    wfe: &WebFrontEnd,
    id: &str,
    req: &HttpRequest,
    body: &[u8],
) -> Result<HttpResponse> {
    let authz = wfe
        .sa
        .get_authorization(id)?
        .ok_or_else(|| Error::malformed("Unable to find authorization"))?;

    // polling surface: challenge statuses and errors show up here
    if req.method() == Method::GET {
        return Ok(HttpResponse::Ok().json(authz));
    }
    if req.method() != Method::POST {
        return Err(Error::malformed("Method not allowed"));
    }

    let challenge_index = req
        .query_string()
        .split('&')
        .find_map(|pair| pair.strip_prefix("challenge="))
        .and_then(|value| value.parse::<usize>().ok())
        .ok_or_else(|| Error::malformed("Invalid challenge index"))?;

    let verified = jws::verify_jws(body)?;
    let registration = registration_by_key(wfe, &verified.key)?;
    if registration.id != authz.registration_id {
        return Err(Error::unauthorized(
            "User registration ID doesn't match registration ID in authorization",
        ));
    }

    let response: ChallengeResponse = parse_payload(&verified.payload)?;
    let updated = wfe.ra.update_authorization(authz, challenge_index, response)?;

    let challenge = updated
        .challenges
        .get(challenge_index)
        .ok_or_else(|| Error::internal("Updated challenge is missing"))?;

    Ok(HttpResponse::Ok()
        .insert_header((header::LOCATION, challenge.uri.clone()))
        .insert_header((
            header::LINK,
            format!("<{}{}>;rel=\"up\"", wfe.url_for(AUTHZ_PATH), updated.id),
        ))
        .json(challenge))
}

async fn new_certificate(
    wfe: web::Data<WebFrontEnd>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    handle_new_certificate(&wfe, &body).unwrap_or_else(|err| problem_response(&err))
}

fn handle_new_certificate(wfe: &WebFrontEnd, body: &[u8]) -> Result<HttpResponse> {
    let verified = jws::verify_jws(body)?;
    let registration = registration_by_key(wfe, &verified.key)?;

    let wire: CertificateRequest = parse_payload(&verified.payload)
        .map_err(|_| Error::malformed("Error unmarshaling certificate request"))?;
    let der = util::base64url_decode(&wire.csr)
        .map_err(|_| Error::malformed("Error unmarshaling certificate request"))?;
    let csr = crate::csr::parse_csr(&der)?;

    let request = IssuanceRequest {
        csr,
        authorizations: wire.authorizations,
    };

    let certificate = wfe
        .ra
        .new_certificate(request, registration.id)
        .map_err(|err| {
            tracing::debug!(%err, "issuance refused");
            match err {
                Error::Malformed(_) => Error::malformed("Error creating new cert"),
                Error::Unauthorized(_) => Error::unauthorized("Error creating new cert"),
                Error::Internal(_) => Error::internal("Error creating new cert"),
            }
        })?;

    Ok(HttpResponse::Created()
        .insert_header((
            header::LOCATION,
            format!("{}{}", wfe.url_for(CERT_PATH), certificate.serial),
        ))
        .insert_header((
            header::LINK,
            format!("<{}>;rel=\"up\"", wfe.url_for(ISSUER_CERT_PATH)),
        ))
        .content_type("application/pkix-cert")
        .body(certificate.der))
}

async fn certificate(
    wfe: web::Data<WebFrontEnd>,
    path: web::Path<String>,
    req: HttpRequest,
) -> HttpResponse {
    if req.method() != Method::GET {
        return method_not_allowed();
    }
    handle_certificate(&wfe, &path).unwrap_or_else(|err| problem_response(&err))
}

fn handle_certificate(wfe: &WebFrontEnd, serial: &str) -> Result<HttpResponse> {
    let der = wfe
        .sa
        .get_certificate(serial)?
        .ok_or_else(|| Error::malformed("Unable to find certificate"))?;
    Ok(HttpResponse::Ok()
        .content_type("application/pkix-cert")
        .body(der))
}
