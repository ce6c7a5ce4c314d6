use crate::errors::CakeError;
use regex::Regex;
use reqwest::{RequestBuilder, Url};
use std::collections::HashMap;

/// Credentials gathered during one registry session
///
/// V2 registries issue bearer tokens in answer to a `WWW-Authenticate`
/// challenge; V1 registries hand out a token with the repository data call.
#[derive(Clone, Debug, Default)]
pub struct Auth {
    bearer: Option<String>,
    docker_token: Option<String>,
}

impl Auth {
    pub fn include_token(&self, req: RequestBuilder) -> RequestBuilder {
        match (&self.bearer, &self.docker_token) {
            (Some(token), _) => req.bearer_auth(token),
            (None, Some(token)) => {
                req.header(reqwest::header::AUTHORIZATION, format!("Token {}", token))
            }
            (None, None) => req,
        }
    }

    pub fn set_docker_token(&mut self, token: String) {
        self.docker_token = Some(token);
    }

    /// Reference: <https://docs.docker.com/registry/spec/auth/token/>
    pub async fn authenticate(
        &mut self,
        req: &reqwest::Client,
        auth_header: &str,
    ) -> Result<(), CakeError> {
        let challenge = BearerChallenge::parse(auth_header)?;
        log::debug!("login challenge, {:?}", challenge);
        let mut query = vec![];
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        let response: Token = req
            .get(challenge.realm.clone())
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let token = response
            .token
            .or(response.access_token)
            .ok_or_else(|| CakeError::RegistryResponse("token response has no token".into()))?;
        log::debug!("received token from {}", challenge.realm);
        self.bearer = Some(token);
        Ok(())
    }
}

#[derive(Deserialize)]
struct Token {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct BearerChallenge {
    realm: Url,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(auth_header: &str) -> Result<Self, CakeError> {
        lazy_static! {
            static ref SCHEME: Regex =
                Regex::new(r"^[ \t]*[Bb][Ee][Aa][Rr][Ee][Rr][ \t]+(?P<params>.*)$").unwrap();
            static ref PARAM: Regex =
                Regex::new(r#"(?P<key>[a-zA-Z]+)="(?P<value>[\x20-\x21\x23-\x5B\x5D-\x7E]*)""#)
                    .unwrap();
        }
        let unsupported = || CakeError::UnsupportedAuthentication(auth_header.to_owned());
        let params = SCHEME
            .captures(auth_header)
            .and_then(|c| c.name("params"))
            .ok_or_else(unsupported)?
            .as_str();
        let mut found: HashMap<&str, &str> = HashMap::new();
        for captures in PARAM.captures_iter(params) {
            if let (Some(key), Some(value)) = (captures.name("key"), captures.name("value")) {
                found.insert(key.as_str(), value.as_str());
            }
        }
        let realm: Url = found
            .get("realm")
            .and_then(|realm| realm.parse().ok())
            .ok_or_else(unsupported)?;
        // auth servers must use https
        if realm.scheme() != "https" {
            return Err(unsupported());
        }
        Ok(BearerChallenge {
            realm,
            service: found.get("service").map(|s| s.to_string()),
            scope: found.get("scope").map(|s| s.to_string()),
        })
    }
}
