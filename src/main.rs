use std::sync::Arc;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use tracing_subscriber::EnvFilter;

mod apis;
mod config;
mod filter;
mod ranking;
mod search;
mod sort;

use config::Config;
use search::{Aggregator, QuerySpec};

const MAX_PAGE_SIZE: u32 = 100;

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LitSearchServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    aggregator: Aggregator,
}

#[tool_router]
impl LitSearchServer {
    pub fn create() -> anyhow::Result<Self> {
        let config = Config::from_env();
        let aggregator = config.build_aggregator()?;

        tracing::info!(
            "Initialized sources [{}], citations {}",
            aggregator.source_keys().join(", "),
            if config.citations_enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            aggregator,
        })
    }

    #[tool(description = "List available literature sources and their status")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        let statuses = self.config.source_status();
        let json = serde_json::to_string_pretty(&statuses)
            .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Search articles across PubMed and arXiv. Results are enriched with citation counts, \
        ranked by citations and recency, optionally filtered by publication year, and sorted. \
        Returns {articles, total} where total counts matches before paging.")]
    async fn search_articles(
        &self,
        Parameters(params): Parameters<QuerySpec>,
    ) -> Result<CallToolResult, McpError> {
        let spec = QuerySpec {
            max_results: params.max_results.min(MAX_PAGE_SIZE),
            ..params
        };
        let response = self
            .aggregator
            .aggregate(&spec)
            .await
            .map_err(|e| McpError::internal_error(format!("Error performing search: {}", e), None))?;
        if !response.failures.is_empty() {
            let failed: Vec<&str> = response.failures.iter().map(|(s, _)| s.as_str()).collect();
            tracing::info!("Search degraded, unavailable: {}", failed.join(", "));
        }

        let json = serde_json::to_string_pretty(&response)
            .map_err(|e| McpError::internal_error(format!("{}", e), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

#[tool_handler]
impl ServerHandler for LitSearchServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Aggregate literature search across PubMed and arXiv. Articles carry \
                 Semantic Scholar citation counts and a relevance ranking that blends \
                 citations with publication recency."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting lit-search MCP server");

    let server = LitSearchServer::create()?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
