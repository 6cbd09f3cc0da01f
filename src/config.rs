// Copyright 2024 The Coder Aggregator Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// The configuration parameters for the application.
///
/// These can either be passed on the command line, or pulled from environment variables.
/// For development convenience, these can also be read from a `.env` file in the working
/// directory where the application is started.
///
/// Without `--coder-url` the Coder deployment is discovered from the
/// `CoderControlPlane` resources of the cluster.
#[derive(clap::Parser, Clone, Debug)]
#[clap(name = "coder-aggregator", version, about)]
pub struct Config {
    /// The port the API server listens on.
    #[clap(long, env = "CODER_AGGREGATOR_PORT", default_value_t = 6443)]
    pub port: u16,

    /// The base URL of a single Coder deployment to serve.
    #[clap(long, env = "CODER_URL")]
    pub coder_url: Option<String>,

    /// The session token used with `--coder-url`.
    #[clap(long, env = "CODER_SESSION_TOKEN", default_value = "", hide_env_values = true)]
    pub coder_session_token: String,

    /// Pins the deployment given by `--coder-url` to one namespace.
    #[clap(long, env = "CODER_NAMESPACE")]
    pub coder_namespace: Option<String>,

    /// Timeout of each request to Coder, in seconds.
    #[clap(long, env = "CODER_REQUEST_TIMEOUT", default_value_t = 30)]
    pub coder_request_timeout: u64,

    /// Watch events buffered per resource before mutations wait for watchers.
    #[clap(long, env = "CODER_WATCH_QUEUE_CAPACITY", default_value_t = 100)]
    pub watch_queue_capacity: usize,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_flags() {
        let config = Config::parse_from([
            "coder-aggregator",
            "--port",
            "8443",
            "--coder-url",
            "https://coder.example.com",
            "--coder-namespace",
            "coder",
        ]);

        assert_eq!(config.port, 8443);
        assert_eq!(config.coder_url.as_deref(), Some("https://coder.example.com"));
        assert_eq!(config.coder_namespace.as_deref(), Some("coder"));
        assert_eq!(config.coder_request_timeout, 30);
    }
}
