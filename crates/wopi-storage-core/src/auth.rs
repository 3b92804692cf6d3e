use url::Url;

/// Name of the query parameter carrying the access token.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Credentials a session presents to the storage host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Authorization {
    #[default]
    None,
    /// An access token, sent both as `access_token` and as a bearer token.
    Token(String),
    /// Raw `Name: value` header lines, separated by CRLF.
    Header(String),
}

impl Authorization {
    pub fn is_none(&self) -> bool {
        matches!(self, Authorization::None)
    }

    /// Set (or replace) the access token query parameter on `uri`.
    pub fn authorize_uri(&self, uri: &mut Url) {
        let Authorization::Token(token) = self else {
            return;
        };

        let params: Vec<(String, String)> = uri
            .query_pairs()
            .filter(|(key, _)| key != ACCESS_TOKEN_PARAM)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        let mut query = uri.query_pairs_mut();
        query.clear();
        for (key, value) in &params {
            query.append_pair(key, value);
        }
        query.append_pair(ACCESS_TOKEN_PARAM, token);
    }

    /// The HTTP headers carrying these credentials.
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            Authorization::None => Vec::new(),
            Authorization::Token(token) => {
                vec![("Authorization".to_string(), format!("Bearer {}", token))]
            }
            Authorization::Header(raw) => raw
                .split("\r\n")
                .flat_map(|line| line.split('\n'))
                .filter_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    let name = name.trim();
                    if name.is_empty() {
                        return None;
                    }
                    Some((name.to_string(), value.trim().to_string()))
                })
                .collect(),
        }
    }
}

/// Clear the value of any `access_token` parameter, keeping the key.
///
/// Stored URIs go through this so tokens never outlive the request that
/// needed them.
pub fn sanitize_uri(uri: &Url) -> Url {
    if !uri.query_pairs().any(|(key, _)| key == ACCESS_TOKEN_PARAM) {
        return uri.clone();
    }

    let params: Vec<(String, String)> = uri
        .query_pairs()
        .map(|(key, value)| {
            if key == ACCESS_TOKEN_PARAM {
                (key.into_owned(), String::new())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();

    let mut sanitized = uri.clone();
    sanitized.query_pairs_mut().clear().extend_pairs(params);
    sanitized
}
