use thiserror::Error;
use url::Url;

const USER_AGENT: &str = concat!("avail/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy url \"{url}\": {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported proxy scheme \"{0}\", expected http, https or socks5")]
    UnsupportedScheme(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Build the HTTP client for one target, optionally routed through a proxy.
///
/// `http`/`https` proxies are used as forward proxies. `socks5` proxies tunnel
/// every connection and resolve host names on the proxy side. Credentials in
/// the proxy URL are used for proxy authentication in both cases. Without a
/// proxy the client connects directly and ignores `HTTP_PROXY` and friends.
pub fn build_client(proxy: Option<&Url>) -> Result<reqwest::Client, ProxyError> {
    let builder = reqwest::Client::builder().user_agent(USER_AGENT);
    let builder = match proxy {
        Some(url) => builder.proxy(proxy_for(url)?),
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

fn proxy_for(url: &Url) -> Result<reqwest::Proxy, ProxyError> {
    if url.host_str().is_none() {
        return Err(ProxyError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }

    match url.scheme() {
        "http" | "https" => Ok(reqwest::Proxy::all(url.as_str())?),
        "socks5" => {
            let mut remote = url.clone();
            remote.set_scheme("socks5h").map_err(|()| ProxyError::InvalidUrl {
                url: url.to_string(),
                reason: "cannot use remote name resolution".to_string(),
            })?;
            Ok(reqwest::Proxy::all(remote.as_str())?)
        }
        other => Err(ProxyError::UnsupportedScheme(other.to_string())),
    }
}
