use memory_gate_test_server::{TestServer, token_from_link};
use serde_json::json;

async fn admit(server: &TestServer, email: &str) -> String {
    let client = server.client();
    let response = client
        .post(format!("{}/gate/lp-form", server.url()))
        .json(&json!({
            "email": email,
            "lp_id": "lp-1",
            "product_type": "standard",
            "recaptcha_token": "ok",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let link = server
        .mail
        .wait_for_link(email, "claim", 5)
        .await
        .expect("claim mail not delivered");
    token_from_link(&link)
}

async fn request_change(
    server: &TestServer,
    token: &str,
    uid: &str,
    email: &str,
    new_email: &str,
) -> reqwest::Response {
    server
        .client()
        .post(format!("{}/claim/email-change", server.url()))
        .header(
            "Authorization",
            format!("Bearer {}", server.identity_assertion(uid, email)),
        )
        .json(&json!({ "token": token, "new_email": new_email }))
        .send()
        .await
        .unwrap()
}

async fn exchange(
    server: &TestServer,
    token: &str,
    uid: &str,
    email: &str,
) -> reqwest::Response {
    server
        .client()
        .post(format!("{}/claim/exchange", server.url()))
        .header(
            "Authorization",
            format!("Bearer {}", server.identity_assertion(uid, email)),
        )
        .json(&json!({ "token": token }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_email_change_full_flow() {
    let server = TestServer::shared().await;
    let token = admit(server, "chg-a@x.com").await;

    let response = request_change(server, &token, "uid-chg", "chg-a@x.com", "chg-b@x.com").await;
    assert_eq!(response.status(), 200);

    // Confirmation goes to the NEW address.
    let confirm_link = server
        .mail
        .wait_for_link("chg-b@x.com", "email_confirm", 5)
        .await
        .expect("confirmation mail not delivered");

    let response = server
        .client()
        .post(format!("{}/claim/email-change/confirm", server.url()))
        .json(&json!({ "token": token_from_link(&confirm_link) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // A fresh claim link lands in the new inbox and is redeemable there.
    let claim_link = server
        .mail
        .wait_for_link("chg-b@x.com", "claim", 5)
        .await
        .expect("re-armed claim mail not delivered");
    let new_token = token_from_link(&claim_link);

    let response = exchange(server, &new_token, "uid-chg", "chg-b@x.com").await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_old_address_cannot_redeem_after_change() {
    let server = TestServer::shared().await;
    let token = admit(server, "chg-old@x.com").await;

    request_change(server, &token, "uid-old", "chg-old@x.com", "chg-new@x.com")
        .await
        .error_for_status()
        .unwrap();

    let confirm_link = server
        .mail
        .wait_for_link("chg-new@x.com", "email_confirm", 5)
        .await
        .unwrap();
    server
        .client()
        .post(format!("{}/claim/email-change/confirm", server.url()))
        .json(&json!({ "token": token_from_link(&confirm_link) }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let claim_link = server
        .mail
        .wait_for_link("chg-new@x.com", "claim", 5)
        .await
        .unwrap();
    let new_token = token_from_link(&claim_link);

    // The row now belongs to the new address.
    let response = exchange(server, &new_token, "uid-old", "chg-old@x.com").await;
    assert_eq!(response.status(), 403);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["claimEmail"], "chg-new@x.com");
}

#[tokio::test]
async fn test_second_change_request_is_rate_limited() {
    let server = TestServer::shared().await;
    let token = admit(server, "chg-limit@x.com").await;

    let first =
        request_change(server, &token, "uid-lim", "chg-limit@x.com", "chg-limit-b@x.com").await;
    assert_eq!(first.status(), 200);

    let second =
        request_change(server, &token, "uid-lim", "chg-limit@x.com", "chg-limit-c@x.com").await;
    assert_eq!(second.status(), 429);
}

#[tokio::test]
async fn test_change_on_redeemed_claim_conflicts() {
    let server = TestServer::shared().await;
    let token = admit(server, "chg-claimed@x.com").await;

    let response = exchange(server, &token, "uid-done", "chg-claimed@x.com").await;
    assert_eq!(response.status(), 200);

    let response =
        request_change(server, &token, "uid-done", "chg-claimed@x.com", "chg-late@x.com").await;
    assert_eq!(response.status(), 409);
}
