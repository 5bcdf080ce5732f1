use std::borrow::Cow;
use std::sync::Arc;

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
        PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    Error as McpError, RoleServer, ServerHandler,
};
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::ToolHostResult;
use crate::middleware::{CallRequest, DynamicRefreshLayer, MiddlewarePipeline, RequestLogLayer};
use crate::plugins::loader::DynamicLoader;
use crate::plugins::ToolDescriptor;
use crate::registry::ToolRegistry;

/// The MCP server: a registry fronted by the middleware pipeline. The tool
/// set is dynamic, so the handler is implemented by hand instead of the
/// static tool-box macro.
#[derive(Clone)]
pub struct ToolHost {
    registry: Arc<ToolRegistry>,
    loader: Arc<DynamicLoader>,
    pipeline: MiddlewarePipeline,
}

impl ToolHost {
    pub fn new(config: ServerConfig) -> ToolHostResult<Self> {
        let registry = Arc::new(ToolRegistry::new());
        let loader = Arc::new(DynamicLoader::new(&config)?);

        crate::tools::register_builtin_tools(&registry, &loader)?;

        let pipeline = MiddlewarePipeline::new(Arc::clone(&registry))
            .with(Arc::new(RequestLogLayer))
            .with(Arc::new(DynamicRefreshLayer::new(
                Arc::clone(&loader),
                Arc::clone(&registry),
            )));

        Ok(Self {
            registry,
            loader,
            pipeline,
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<DynamicLoader> {
        &self.loader
    }
}

/// Convert a descriptor to its outward wire form.
fn to_wire_tool(descriptor: ToolDescriptor) -> Tool {
    let schema = match descriptor.input_schema {
        Value::Object(map) => map,
        // Descriptors always carry object schemas; anything else would be
        // a worker bug, surfaced as an empty parameter object.
        _ => serde_json::Map::new(),
    };

    Tool {
        name: Cow::Owned(descriptor.name),
        description: Cow::Owned(descriptor.description),
        input_schema: Arc::new(schema),
    }
}

impl ServerHandler for ToolHost {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "A dynamic tool server that discovers user plugins on disk, isolates each in its own Python environment, and exposes their public functions as callable tools".to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: PaginatedRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self
            .pipeline
            .list_tools()
            .await
            .map_err(|e| e.to_mcp_error())?;

        Ok(ListToolsResult {
            next_cursor: None,
            tools: tools
                .into_iter()
                .map(|(descriptor, _kind)| to_wire_tool(descriptor))
                .collect(),
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();
        let value = self
            .pipeline
            .call_tool(CallRequest {
                name: request.name.to_string(),
                arguments,
            })
            .await
            .map_err(|e| e.to_mcp_error())?;

        let text = match value {
            Value::String(s) => s,
            other => serde_json::to_string(&other).unwrap_or_else(|_| other.to_string()),
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}
