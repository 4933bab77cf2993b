/// Identity presented to both the push channel and the REST API.
pub struct Credentials {
    user_id: String,
    api_token: Option<String>,
}

impl Credentials {
    pub fn new(user_id: String, api_token: Option<String>) -> Self {
        Self {
            user_id,
            api_token: api_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn has_token(&self) -> bool {
        self.api_token.is_some()
    }

    /// Build auth headers for a request.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("X-User-Id".to_string(), self.user_id.clone())];
        if let Some(token) = &self.api_token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        headers
    }
}
