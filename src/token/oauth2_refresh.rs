use super::RefreshedToken;
use crate::credentials::CredentialBundle;
use crate::error::SyncError;

use oauth2::{
    Client as OAuth2Client, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken,
    StandardRevocableToken, TokenResponse as _, TokenUrl,
    basic::{
        BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
        BasicTokenResponse,
    },
};
use tracing::info;

/// Exchange the stored refresh token at the bundle's token endpoint.
pub(super) async fn refresh_access_token(
    bundle: &CredentialBundle,
    http_client: reqwest::Client,
) -> Result<RefreshedToken, SyncError> {
    let client = build_oauth2_client(bundle)?;
    let token_result: BasicTokenResponse = client
        .exchange_refresh_token(&RefreshToken::new(
            bundle.require("refresh_token")?.to_string(),
        ))
        .request_async(&http_client)
        .await?;
    info!(service = %bundle.service, "refresh-token grant succeeded");

    Ok(RefreshedToken {
        access_token: token_result.access_token().secret().clone(),
        refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
        expires_in: token_result.expires_in(),
        scope: token_result.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }),
    })
}

/// Build the OAuth2 client from bundle fields; the token endpoint comes from
/// the bundle so the engine stays provider-agnostic.
fn build_oauth2_client(bundle: &CredentialBundle) -> Result<Oauth2RefreshClient, SyncError> {
    let client = OAuth2Client::new(ClientId::new(bundle.require("client_id")?.to_string()))
        .set_client_secret(ClientSecret::new(bundle.require("client_secret")?.to_string()))
        .set_token_uri(TokenUrl::new(bundle.require("token_uri")?.to_string())?);
    Ok(client)
}

type Oauth2RefreshClient = OAuth2Client<
    BasicErrorResponse,
    BasicTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;
