//! Headless Chrome 网关
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 是同步 API，所有调用都放进 spawn_blocking，不阻塞编排器所在的 runtime。
//!
//! 可交互元素通过注入脚本打上 `data-courier-ref` 属性，Manager 看到的 selector
//! 形如 `[data-courier-ref="3"]`，可直接回传给 CLICK / TYPE。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use serde::Deserialize;

use crate::env::{
    ActionOutcome, ActionSpec, EnvError, EnvironmentGateway, InteractiveElement, PageImage,
    PageSnapshot, PrimitiveKind, RecordedAction, SemanticIndex, TabHandle,
};

const ELEMENTS_JS: &str = r#"
(function() {
    const nodes = document.querySelectorAll('a, button, input, select, textarea, [role="button"], [role="link"], [contenteditable="true"]');
    const out = [];
    let i = 0;
    for (const el of nodes) {
        const rect = el.getBoundingClientRect();
        if (rect.width === 0 && rect.height === 0) continue;
        i++;
        el.setAttribute('data-courier-ref', String(i));
        const role = el.getAttribute('role') || el.tagName.toLowerCase();
        const name = (el.getAttribute('aria-label') || el.innerText || el.value || el.placeholder || el.getAttribute('href') || '').trim().substring(0, 80);
        out.push({ selector: '[data-courier-ref="' + i + '"]', role: role, name: name });
    }
    const imgs = Array.from(document.images).slice(0, 50).map(img => ({ src: img.currentSrc || img.src, alt: img.alt || '' }));
    return JSON.stringify({ elements: out, images: imgs });
})()
"#;

const LEARNING_ON_JS: &str = r#"
(function() {
    if (window.__courierRecorder) return 'already';
    window.__courierRecorded = window.__courierRecorded || [];
    window.__courierRecorder = function(ev) {
        const el = ev.target;
        if (!el || !el.getAttribute) return;
        const ref = el.getAttribute('data-courier-ref');
        const selector = ref ? '[data-courier-ref="' + ref + '"]' : (el.id ? '#' + el.id : el.tagName.toLowerCase());
        const entry = { action: ev.type === 'click' ? 'CLICK' : 'TYPE', selector: selector, pageUrl: location.href, recordedAt: Date.now() };
        if (ev.type === 'change') entry.text = String(el.value || '');
        window.__courierRecorded.push(entry);
    };
    document.addEventListener('click', window.__courierRecorder, true);
    document.addEventListener('change', window.__courierRecorder, true);
    return 'on';
})()
"#;

/// 摘掉监听并交出录制结果（JSON 字符串），同时清空页面内的缓冲
const LEARNING_OFF_JS: &str = r#"
(function() {
    if (window.__courierRecorder) {
        document.removeEventListener('click', window.__courierRecorder, true);
        document.removeEventListener('change', window.__courierRecorder, true);
        window.__courierRecorder = undefined;
    }
    const out = JSON.stringify(window.__courierRecorded || []);
    window.__courierRecorded = [];
    return out;
})()
"#;

#[derive(Deserialize)]
struct ElementDump {
    elements: Vec<InteractiveElement>,
    images: Vec<PageImage>,
}

/// Headless Chrome 实现：浏览器懒启动，标签页按句柄保存
pub struct ChromeGateway {
    browser: Arc<RwLock<Option<Browser>>>,
    tabs: Arc<RwLock<HashMap<TabHandle, Arc<Tab>>>>,
    next_id: AtomicUsize,
    index: SemanticIndex,
}

fn browser_err(e: impl std::fmt::Display) -> EnvError {
    EnvError::Browser(e.to_string())
}

impl ChromeGateway {
    pub fn new(index: SemanticIndex) -> Self {
        Self {
            browser: Arc::new(RwLock::new(None)),
            tabs: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicUsize::new(0),
            index,
        }
    }

    fn tab(&self, handle: &TabHandle) -> Result<Arc<Tab>, EnvError> {
        self.tabs
            .read()
            .map_err(browser_err)?
            .get(handle)
            .cloned()
            .ok_or_else(|| EnvError::NoSuchTab(handle.to_string()))
    }

    fn read_snapshot(tab: &Arc<Tab>) -> Result<PageSnapshot, EnvError> {
        let url = tab.get_url();
        let title = tab.get_title().map_err(browser_err)?;
        let html = tab.get_content().map_err(browser_err)?;
        let main_content = html2text::from_read(html.as_bytes(), 120).unwrap_or(html);

        let dump = tab
            .evaluate(ELEMENTS_JS, false)
            .map_err(browser_err)?
            .value
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|s| serde_json::from_str::<ElementDump>(&s).ok());
        let (interactive_elements, images) = match dump {
            Some(d) => (d.elements, d.images),
            None => (vec![], vec![]),
        };

        Ok(PageSnapshot {
            url,
            title,
            main_content,
            interactive_elements,
            images,
        })
    }

    fn run_action(tab: &Arc<Tab>, spec: &ActionSpec) -> Result<ActionOutcome, EnvError> {
        let selector = || {
            spec.selector
                .clone()
                .ok_or_else(|| EnvError::ElementNotFound("missing selector".into()))
        };
        let find = |sel: &str| {
            tab.wait_for_element(sel)
                .map_err(|e| EnvError::ElementNotFound(format!("{sel}: {e}")))
        };

        let message = match spec.action {
            PrimitiveKind::Navigate => {
                let url = spec
                    .url
                    .as_deref()
                    .ok_or_else(|| EnvError::Navigation("missing url".into()))?;
                tab.navigate_to(url)
                    .map_err(|e| EnvError::Navigation(e.to_string()))?;
                tab.wait_until_navigated()
                    .map_err(|e| EnvError::Navigation(e.to_string()))?;
                format!("Navigated to {url}")
            }
            PrimitiveKind::Click => {
                let sel = selector()?;
                find(&sel)?.click().map_err(browser_err)?;
                format!("Clicked {sel}")
            }
            PrimitiveKind::Type => {
                let sel = selector()?;
                let text = spec.text.clone().unwrap_or_default();
                let el = find(&sel)?;
                el.click().map_err(browser_err)?;
                el.type_into(&text).map_err(browser_err)?;
                format!("Typed into {sel}")
            }
            PrimitiveKind::Submit => {
                let sel = selector()?;
                find(&sel)?.click().map_err(browser_err)?;
                tab.press_key("Enter").map_err(browser_err)?;
                format!("Submitted {sel}")
            }
            PrimitiveKind::Scroll => {
                let amount = match spec.text.as_deref() {
                    Some("up") => -600,
                    _ => 600,
                };
                tab.evaluate(&format!("window.scrollBy(0, {amount})"), false)
                    .map_err(browser_err)?;
                "Scrolled".to_string()
            }
        };

        Ok(ActionOutcome {
            message,
            url: Some(tab.get_url()),
        })
    }
}

#[async_trait]
impl EnvironmentGateway for ChromeGateway {
    async fn snapshot(&self, tab: &TabHandle) -> Result<PageSnapshot, EnvError> {
        let tab = self.tab(tab)?;
        tokio::task::spawn_blocking(move || Self::read_snapshot(&tab))
            .await
            .map_err(|e| EnvError::Browser(format!("Task join: {e}")))?
    }

    async fn execute(&self, tab: &TabHandle, spec: &ActionSpec) -> Result<ActionOutcome, EnvError> {
        let tab = self.tab(tab)?;
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || Self::run_action(&tab, &spec))
            .await
            .map_err(|e| EnvError::Browser(format!("Task join: {e}")))?
    }

    async fn create_tab(&self, url: &str) -> Result<TabHandle, EnvError> {
        let browser = Arc::clone(&self.browser);
        let url = url.to_string();
        let tab = tokio::task::spawn_blocking(move || {
            let mut guard = browser.write().map_err(browser_err)?;
            if guard.is_none() {
                *guard = Some(
                    Browser::default()
                        .map_err(|e| EnvError::Browser(format!("Chrome launch failed: {e}")))?,
                );
            }
            let browser = guard
                .as_ref()
                .ok_or_else(|| EnvError::Browser("browser not running".into()))?;
            let tab = browser.new_tab().map_err(browser_err)?;
            tab.navigate_to(&url)
                .map_err(|e| EnvError::Navigation(e.to_string()))?;
            tab.wait_until_navigated()
                .map_err(|e| EnvError::Navigation(e.to_string()))?;
            Ok::<_, EnvError>(tab)
        })
        .await
        .map_err(|e| EnvError::Browser(format!("Task join: {e}")))??;

        let handle = TabHandle(format!(
            "chrome-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed) + 1
        ));
        self.tabs
            .write()
            .map_err(browser_err)?
            .insert(handle.clone(), tab);
        tracing::info!(tab = %handle, "browser tab created");
        Ok(handle)
    }

    async fn switch_tab(&self, tab: &TabHandle) -> Result<(), EnvError> {
        let tab = self.tab(tab)?;
        tokio::task::spawn_blocking(move || tab.activate().map(|_| ()).map_err(browser_err))
            .await
            .map_err(|e| EnvError::Browser(format!("Task join: {e}")))?
    }

    async fn wait_for_load(&self, tab: &TabHandle) -> Result<(), EnvError> {
        let tab = self.tab(tab)?;
        tokio::task::spawn_blocking(move || {
            tab.wait_until_navigated()
                .map(|_| ())
                .map_err(|e| EnvError::Timeout(e.to_string()))
        })
        .await
        .map_err(|e| EnvError::Browser(format!("Task join: {e}")))?
    }

    async fn semantic_search(
        &self,
        tab: &TabHandle,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, EnvError> {
        let page = self.snapshot(tab).await?;
        Ok(self.index.search(&page.main_content, query, k).await)
    }

    async fn set_learning(
        &self,
        tab: &TabHandle,
        enabled: bool,
    ) -> Result<Vec<RecordedAction>, EnvError> {
        let tab = self.tab(tab)?;
        let js = if enabled { LEARNING_ON_JS } else { LEARNING_OFF_JS };
        let value = tokio::task::spawn_blocking(move || {
            tab.evaluate(js, false).map(|r| r.value).map_err(browser_err)
        })
        .await
        .map_err(|e| EnvError::Browser(format!("Task join: {e}")))??;
        if enabled {
            return Ok(Vec::new());
        }
        let raw = value
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap_or("[]");
        parse_recording(raw)
    }
}

/// 解析页面内录制缓冲；同一元素的连续 TYPE 只保留最后一次
fn parse_recording(raw: &str) -> Result<Vec<RecordedAction>, EnvError> {
    let actions: Vec<RecordedAction> = serde_json::from_str(raw)
        .map_err(|e| EnvError::Browser(format!("recording unreadable: {e}")))?;
    let mut out: Vec<RecordedAction> = Vec::with_capacity(actions.len());
    for action in actions {
        let repeat = out.last().is_some_and(|prev| {
            prev.spec.action == PrimitiveKind::Type
                && action.spec.action == PrimitiveKind::Type
                && prev.spec.selector == action.spec.selector
        });
        if repeat {
            out.pop();
        }
        out.push(action);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recording_from_page_buffer() {
        let raw = r##"[
            {"action": "CLICK", "selector": "[data-courier-ref=\"3\"]", "pageUrl": "https://mail.example.com/", "recordedAt": 1700000000000},
            {"action": "TYPE", "selector": "#q", "text": "inv", "pageUrl": "https://mail.example.com/", "recordedAt": 1700000000100},
            {"action": "TYPE", "selector": "#q", "text": "invoice", "pageUrl": "https://mail.example.com/", "recordedAt": 1700000000200}
        ]"##;
        let actions = parse_recording(raw).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].spec.action, PrimitiveKind::Click);
        assert_eq!(actions[0].host().as_deref(), Some("mail.example.com"));
        assert_eq!(actions[1].spec.text.as_deref(), Some("invoice"));
    }

    #[test]
    fn test_parse_recording_rejects_garbage() {
        assert!(parse_recording("not json").is_err());
        assert!(parse_recording("[]").unwrap().is_empty());
    }
}
