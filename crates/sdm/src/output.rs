use serde::Serialize;

/// Prints command results either for people or as one JSON object per line.
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Output a successful result
    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        if self.json {
            let response = JsonResponse {
                status: "ok",
                command,
                data: Some(data),
                error: None,
            };
            println!("{}", encode(&response));
        } else {
            println!("{}", encode_pretty(&data));
        }
    }

    /// Output a simple success message
    pub fn success_message(&self, command: &str, message: &str) {
        if self.json {
            self.success(command, serde_json::json!({ "message": message }));
        } else {
            println!("{}", message);
        }
    }

    /// Output an error
    pub fn error(&self, message: &str) {
        if self.json {
            let response: JsonResponse<()> = JsonResponse {
                status: "error",
                command: "",
                data: None,
                error: Some(message),
            };
            eprintln!("{}", encode(&response));
        } else {
            eprintln!("Error: {}", message);
        }
    }

    /// Non-fatal progress note. Goes to stderr so stdout stays parseable.
    pub fn notice(&self, message: &str) {
        if self.json {
            eprintln!("{}", encode(&serde_json::json!({ "notice": message })));
        } else {
            eprintln!("{}", message);
        }
    }

    /// One event of a `listen` stream
    pub fn event<T: Serialize>(&self, event_type: &str, data: T) {
        if self.json {
            let event = StreamEvent {
                event: event_type,
                data,
            };
            println!("{}", encode(&event));
        } else {
            println!("[{}] {}", event_type, encode(&data));
        }
    }
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!(r#"{{"status":"error","error":"unserializable output: {}"}}"#, e))
}

fn encode_pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| encode(value))
}

#[derive(Serialize)]
struct JsonResponse<'a, T: Serialize> {
    status: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct StreamEvent<'a, T: Serialize> {
    event: &'a str,
    #[serde(flatten)]
    data: T,
}
