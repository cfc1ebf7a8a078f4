//! Canned reply bodies, used when a reply bypasses the modules.

use crate::reply::Status;

pub fn html_body(status: Status, server_name: &str) -> Vec<u8> {
    let code = status.code();
    let message = status.reason();
    format!(
        "<html>\r\n\
         <head><title>{message}</title></head>\r\n\
         <body>\r\n\
         <center><h1>{code} {message}</h1></center>\r\n\
         <hr><center>{server_name}</center>\r\n\
         </body>\r\n\
         </html>\r\n"
    )
    .into_bytes()
}

pub fn json_body(status: Status) -> Vec<u8> {
    let message = serde_json::Value::from(status.reason());
    format!(
        r#"{{"error": {{"code":{},"message":{message}}}}}"#,
        status.code()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_body_layout() {
        let body = String::from_utf8(html_body(Status::NotFound, "garrison")).expect("utf8");
        assert_eq!(
            body,
            "<html>\r\n<head><title>Not Found</title></head>\r\n<body>\r\n\
             <center><h1>404 Not Found</h1></center>\r\n<hr><center>garrison</center>\r\n\
             </body>\r\n</html>\r\n"
        );
    }

    #[test]
    fn test_json_body_is_valid_json() {
        let body = json_body(Status::BadRequest);
        let value: serde_json::Value = serde_json::from_slice(&body).expect("valid json");
        assert_eq!(value["error"]["code"], 400);
        assert_eq!(value["error"]["message"], "Bad Request");
    }
}
