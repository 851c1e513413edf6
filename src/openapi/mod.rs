use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub const OPENAPI_JSON_PATH: &str = "/api-docs/openapi.json";

/// Registers the `BearerAuth` JWT scheme referenced by protected routes
struct BearerAuthAddon;

impl Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "BearerAuth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Inventory API",
        version = "1.0.0",
        description = r#"
API for managing inventory.

Reads are public. Stock decrements require a bearer JWT; creating, deleting
and restocking products require the `admin` role (or the `X-Override-Key`
header). A decrement batch is applied in full or not at all.
        "#
    ),
    tags(
        (name = "Inventory", description = "Product stock lookups"),
        (name = "Inventory Management", description = "Create and delete products"),
        (name = "Stock Management", description = "Increase and decrease stock"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::inventory::list_inventory,
        crate::handlers::inventory::get_product_stock,
        crate::handlers::inventory::create_products,
        crate::handlers::inventory::delete_products,
        crate::handlers::inventory::increase_stock,
        crate::handlers::inventory::decrease_stock,
        crate::health::health_check,
    ),
    components(
        schemas(
            crate::store::Product,
            crate::handlers::inventory::CreateProductRequest,
            crate::handlers::inventory::DeleteProductRequest,
            crate::handlers::inventory::DeleteProductsResponse,
            crate::handlers::inventory::StockRequest,
            crate::handlers::inventory::DecreaseStockRequest,
            crate::health::HealthResponse,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&BearerAuthAddon)
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url(OPENAPI_JSON_PATH, ApiDocV1::openapi())
}
