//! Built-in API endpoints.
//!
//! | Method | Path              | Reply                                   |
//! |--------|-------------------|-----------------------------------------|
//! | GET    | `/api/v1/ping`    | `{"ok":true,"message":"OK"}`            |
//! | GET    | `/api/v1/time`    | `{"serverTime":<unix seconds>}`         |
//! | GET    | `/api/v1/db/ping` | the same ping, built by PostgreSQL      |
//! | GET    | `/api/v1/db/time` | the server time, as seen by PostgreSQL  |
//! | GET    | `/quit`           | graceful shutdown (single mode, loopback only) |
//! | OPTIONS| any               | 200 with `Allow`                        |

use garrison_http::{ContentType, DEFAULT_ALLOWED_METHODS, Reply, Request, Status};
use garrison_pg::QueryResult;
use serde_json::json;

use crate::error::{ServerError, ServerResult};
use crate::module::{Module, ModuleContext, QueryHandler};

const OK_BODY: &str = r#"{"ok":true,"message":"OK"}"#;
const PING_SQL: &str = "SELECT json_build_object('ok', true, 'message', 'OK')::text AS json";
const TIME_SQL: &str =
    "SELECT json_build_object('serverTime', extract(epoch from now())::integer)::text AS json";

/// Catch-all module serving the bundled endpoints.
pub struct ApiModule {
    keep_alive: bool,
}

impl ApiModule {
    pub fn new(keep_alive: bool) -> Self {
        Self { keep_alive }
    }

    fn do_get(&self, ctx: &mut ModuleContext<'_>, path: &str) {
        match path {
            "/api/v1/ping" => ctx.send_json(Status::Ok, OK_BODY),
            "/api/v1/time" => {
                let now = chrono::Utc::now().timestamp();
                ctx.send_json(Status::Ok, json!({ "serverTime": now }).to_string());
            }
            "/api/v1/db/ping" => self.exec_sql(ctx, PING_SQL),
            "/api/v1/db/time" => self.exec_sql(ctx, TIME_SQL),
            "/quit" if ctx.quit_allowed() && ctx.peer().ip().is_loopback() => {
                ctx.request_shutdown();
                ctx.send_json(Status::Ok, OK_BODY);
            }
            _ => ctx.send_stock_reply(Status::NotFound),
        }
    }

    fn exec_sql(&self, ctx: &mut ModuleContext<'_>, sql: &str) {
        let mut query = ctx.get_query(JsonCell);
        query.add(sql);
        ctx.start_query(query);
    }
}

impl Module for ApiModule {
    fn name(&self) -> &str {
        "api"
    }

    fn check(&self, _request: &Request) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut ModuleContext<'_>) -> ServerResult<()> {
        let path = ctx.request().path();
        if !path.starts_with('/') || path.contains("..") {
            ctx.send_stock_reply(Status::BadRequest);
            return Ok(());
        }

        if !self.keep_alive {
            ctx.reply().close_connection = true;
        }

        match ctx.request().method.as_str() {
            "GET" => self.do_get(ctx, &path),
            "OPTIONS" => {
                ctx.reply().headers.add("Allow", DEFAULT_ALLOWED_METHODS);
                ctx.send_reply(Status::Ok);
            }
            _ => {
                ctx.reply().allowed_methods = DEFAULT_ALLOWED_METHODS.to_string();
                ctx.send_stock_reply(Status::MethodNotAllowed);
            }
        }
        Ok(())
    }
}

/// Replies with the first cell of the first result, which the SQL above
/// renders as JSON text.
struct JsonCell;

impl QueryHandler for JsonCell {
    fn on_executed(
        &mut self,
        _request: &Request,
        reply: &mut Reply,
        results: &[QueryResult],
    ) -> ServerResult<()> {
        let cell = results
            .first()
            .and_then(|r| r.value(0, 0))
            .ok_or_else(|| ServerError::module("query returned no rows"))?;
        reply.content_type = ContentType::Json;
        reply.content = cell.as_bytes().to_vec();
        reply.status = Status::Ok;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Action;
    use std::net::SocketAddr;
    use test_case::test_case;

    fn run(module: &mut ApiModule, request: &Request, quit_allowed: bool) -> (Reply, Action, bool) {
        let mut reply = Reply::default();
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let mut ctx = ModuleContext::new(request, &mut reply, peer, quit_allowed);
        module.execute(&mut ctx).unwrap();
        let action = std::mem::replace(&mut ctx.action, Action::Deferred);
        let quit = ctx.quit_requested;
        (reply, action, quit)
    }

    #[test]
    fn test_ping() {
        let (reply, action, _) = run(&mut ApiModule::new(true), &Request::new("GET", "/api/v1/ping"), false);
        assert!(matches!(action, Action::Reply));
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.content, OK_BODY.as_bytes());
        assert_eq!(reply.content_type, ContentType::Json);
    }

    #[test]
    fn test_time_is_numeric() {
        let (reply, _, _) = run(&mut ApiModule::new(true), &Request::new("GET", "/api/v1/time"), false);
        let value: serde_json::Value = serde_json::from_slice(&reply.content).unwrap();
        assert!(value["serverTime"].as_i64().unwrap() > 1_600_000_000);
    }

    #[test_case("GET", "/nope", Status::NotFound ; "unknown path")]
    #[test_case("GET", "/a/../b", Status::BadRequest ; "dot dot")]
    #[test_case("GET", "a", Status::BadRequest ; "relative path")]
    #[test_case("POST", "/api/v1/ping", Status::MethodNotAllowed ; "post")]
    #[test_case("GET", "/quit", Status::NotFound ; "quit when not allowed")]
    fn test_stock_replies(method: &str, uri: &str, expected: Status) {
        let (_, action, _) = run(&mut ApiModule::new(true), &Request::new(method, uri), false);
        match action {
            Action::Stock(status) => assert_eq!(status, expected),
            _ => panic!("expected a stock reply"),
        }
    }

    #[test]
    fn test_options_lists_methods() {
        let (reply, action, _) = run(&mut ApiModule::new(true), &Request::new("OPTIONS", "/api/v1/ping"), false);
        assert!(matches!(action, Action::Reply));
        assert_eq!(reply.headers.get("allow"), Some(DEFAULT_ALLOWED_METHODS));
    }

    #[test]
    fn test_db_endpoint_starts_query() {
        let (_, action, _) = run(&mut ApiModule::new(true), &Request::new("GET", "/api/v1/db/ping"), false);
        match action {
            Action::Query(query) => assert_eq!(query.sql, vec![PING_SQL.to_string()]),
            _ => panic!("expected a query"),
        }
    }

    #[test]
    fn test_quit_from_loopback() {
        let (_, action, quit) = run(&mut ApiModule::new(true), &Request::new("GET", "/quit"), true);
        assert!(matches!(action, Action::Reply));
        assert!(quit);
    }

    #[test]
    fn test_json_cell_uses_first_value() {
        let mut result = QueryResult::new(garrison_pg::ResultStatus::TuplesOk);
        result.columns = vec!["json".to_string()];
        result.rows = vec![vec![Some(r#"{"serverTime":1}"#.to_string())]];
        let mut reply = Reply::default();
        JsonCell
            .on_executed(&Request::default(), &mut reply, &[result])
            .unwrap();
        assert_eq!(reply.content, br#"{"serverTime":1}"#.to_vec());
    }
}
