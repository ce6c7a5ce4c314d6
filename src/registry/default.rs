/// Settings for the registry used when an image url names no host
///
/// The default registry can be known under several host names, and
/// repositories on it with only one path component live under a library
/// prefix. Other registries are "standalone" and use paths unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultRegistry {
    /// Connect to the registry under this name
    pub network_name: String,
    /// This registry is also known under additional names
    pub also_known_as: Vec<String>,
    /// Prefix for repositories with only a single path component
    pub library_prefix: Option<String>,
}

impl Default for DefaultRegistry {
    fn default() -> Self {
        DefaultRegistry {
            network_name: "registry-1.docker.io".to_owned(),
            also_known_as: vec!["docker.io".to_owned(), "index.docker.io".to_owned()],
            library_prefix: Some("library".to_owned()),
        }
    }
}

impl From<&str> for DefaultRegistry {
    fn from(network_name: &str) -> Self {
        DefaultRegistry {
            network_name: network_name.to_owned(),
            also_known_as: vec![],
            library_prefix: None,
        }
    }
}

impl DefaultRegistry {
    /// Is this host (or no host at all) the default registry?
    pub fn is_default(&self, host: Option<&str>) -> bool {
        match host {
            None => true,
            Some(host) => {
                host == self.network_name || self.also_known_as.iter().any(|aka| aka == host)
            }
        }
    }

    /// Determine the host to contact and the repository path to ask it for
    pub fn resolve(&self, host: Option<&str>, path: &str) -> (String, String) {
        if !self.is_default(host) {
            let host = host.unwrap_or(&self.network_name);
            return (host.to_owned(), path.to_owned());
        }
        let remote = match &self.library_prefix {
            Some(prefix) if !path.contains('/') => format!("{}/{}", prefix, path),
            _ => path.to_owned(),
        };
        (self.network_name.clone(), remote)
    }
}
