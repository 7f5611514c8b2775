pub const DASHBOARD_INDEX_HTML: &str = r#"
<!doctype html>
<html lang="en">

<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Vision Dashboard</title>
  <style>
    :root {
      --bg: #0b1220;
      --panel: #111c30;
      --accent: #38bdf8;
      --input: #facc15;
      --service: #fb7185;
      --ok: #4ade80;
      --text: #e2e8f0;
      --muted: #94a3b8;
    }
    body { margin: 0; font-family: ui-sans-serif, system-ui, sans-serif; background: var(--bg); color: var(--text); }
    main { max-width: 960px; margin: 0 auto; padding: 24px; display: grid; gap: 16px; }
    section { background: var(--panel); border-radius: 10px; padding: 16px; }
    h1 { margin: 0; font-size: 1.4rem; }
    h2 { margin: 0 0 12px; font-size: 1.05rem; color: var(--accent); }
    button { background: var(--accent); color: #04111f; border: 0; border-radius: 6px; padding: 8px 14px; font-weight: 600; cursor: pointer; }
    button.secondary { background: transparent; color: var(--muted); border: 1px solid var(--muted); }
    button:disabled { opacity: 0.5; cursor: progress; }
    .row { display: flex; gap: 12px; align-items: center; flex-wrap: wrap; }
    .muted { color: var(--muted); font-size: 0.9rem; }
    .badge { border-radius: 999px; padding: 2px 10px; font-size: 0.8rem; font-weight: 700; text-transform: uppercase; }
    .badge.input { background: var(--input); color: #1f1600; }
    .badge.service { background: var(--service); color: #2a0610; }
    .badge.ok { background: var(--ok); color: #052e14; }
    #result-image { max-width: 100%; border-radius: 6px; background: #000; }
    table { border-collapse: collapse; width: 100%; font-size: 0.9rem; }
    td, th { text-align: left; padding: 4px 8px; border-bottom: 1px solid #1e293b; }
    [hidden] { display: none !important; }
  </style>
</head>

<body>
  <main>
    <header class="row">
      <h1>Vision Dashboard</h1>
      <span id="api-status" class="muted">checking API…</span>
    </header>

    <section>
      <h2>Upload</h2>
      <form id="upload-form" class="row">
        <input id="file" type="file" accept="image/png,image/jpeg,image/bmp,image/tiff" required />
        <button id="upload-button" type="submit">Process</button>
        <button id="clear-button" class="secondary" type="button">Clear session</button>
      </form>
      <p id="last-upload" class="muted"></p>
    </section>

    <section id="error-panel" hidden>
      <div class="row">
        <span id="error-badge" class="badge"></span>
        <h2 id="error-title" style="margin: 0"></h2>
      </div>
      <p id="error-detail"></p>
      <p id="error-request" class="muted"></p>
      <button id="retry-button" type="button" hidden>Retry</button>
    </section>

    <section id="result-panel" hidden>
      <div class="row">
        <span class="badge ok">done</span>
        <h2 id="result-title" style="margin: 0"></h2>
      </div>
      <p id="result-meta" class="muted"></p>
      <img id="result-image" alt="processed image" hidden />
      <p id="result-terminated" class="muted"></p>
      <h2>Measurements</h2>
      <table id="measurements"></table>
      <h2>Detections</h2>
      <table id="detections"></table>
      <h2>Stages</h2>
      <table id="stages"></table>
    </section>
  </main>

  <script>
    const $ = (id) => document.getElementById(id);

    function renderRows(table, header, rows) {
      table.innerHTML = "";
      if (rows.length === 0) {
        table.innerHTML = "<tr><td class=\"muted\">none</td></tr>";
        return;
      }
      const head = document.createElement("tr");
      header.forEach((h) => { const th = document.createElement("th"); th.textContent = h; head.appendChild(th); });
      table.appendChild(head);
      rows.forEach((cells) => {
        const tr = document.createElement("tr");
        cells.forEach((c) => { const td = document.createElement("td"); td.textContent = c; tr.appendChild(td); });
        table.appendChild(tr);
      });
    }

    function renderOutcome(outcome) {
      $("error-panel").hidden = true;
      $("result-panel").hidden = true;
      if (!outcome) return;
      if (outcome.status === "failure") {
        const err = outcome.error;
        $("error-badge").textContent = err.category === "input" ? "check your file" : "service problem";
        $("error-badge").className = "badge " + err.category;
        $("error-title").textContent = err.title;
        $("error-detail").textContent = err.detail;
        $("error-request").textContent = err.request_id ? "request " + err.request_id : "";
        $("retry-button").hidden = !err.retryable;
        $("error-panel").hidden = false;
        return;
      }
      const r = outcome.result;
      $("result-title").textContent = r.image ? r.width + "×" + r.height + " " + r.format : "no output image";
      $("result-meta").textContent = "request " + r.request_id + " · total " + r.timings.total_ms.toFixed(1) + " ms";
      const img = $("result-image");
      if (r.image) {
        img.src = "data:image/" + r.format + ";base64," + r.image;
        img.hidden = false;
      } else {
        img.hidden = true;
      }
      $("result-terminated").textContent = r.terminated_by
        ? "stopped at " + r.terminated_by.stage + ": " + r.terminated_by.reason
        : "";
      renderRows($("measurements"), ["name", "value"],
        Object.entries(r.measurements).map(([k, v]) => [k, Number(v).toFixed(3)]));
      renderRows($("detections"), ["label", "bbox", "area", "score"],
        r.detections.map((d) => [d.label, d.bbox.join(", "), d.area, d.score.toFixed(2)]));
      renderRows($("stages"), ["stage", "ms", "outcome"],
        r.stages.map((s) => [s.name, s.elapsed_ms.toFixed(2), s.outcome]));
      $("result-panel").hidden = false;
    }

    function renderSession(view) {
      $("last-upload").textContent = view.file_name
        ? "last upload: " + view.file_name + " (" + view.size_bytes + " bytes, " + view.attempts + " attempt(s))"
        : "";
      renderOutcome(view.outcome);
    }

    async function refreshSession() {
      const resp = await fetch("/session", { credentials: "same-origin" });
      if (resp.ok) renderSession(await resp.json());
    }

    async function send(path, init) {
      $("upload-button").disabled = true;
      $("retry-button").disabled = true;
      try {
        const resp = await fetch(path, Object.assign({ credentials: "same-origin" }, init));
        renderOutcome(await resp.json());
      } catch (e) {
        renderOutcome({ status: "failure", error: {
          category: "service", title: "The dashboard is unreachable", detail: String(e), retryable: true } });
      } finally {
        $("upload-button").disabled = false;
        $("retry-button").disabled = false;
        refreshSession();
      }
    }

    $("upload-form").addEventListener("submit", (ev) => {
      ev.preventDefault();
      const file = $("file").files[0];
      if (!file) return;
      send("/upload", {
        method: "POST",
        headers: {
          "content-type": file.type || "application/octet-stream",
          "x-file-name": file.name.replace(/[^\x20-\x7e]/g, "_"),
        },
        body: file,
      });
    });

    $("retry-button").addEventListener("click", () => send("/retry", { method: "POST" }));

    $("clear-button").addEventListener("click", async () => {
      await fetch("/session", { method: "DELETE", credentials: "same-origin" });
      $("file").value = "";
      renderSession({});
    });

    async function refreshHealth() {
      try {
        const resp = await fetch("/health");
        const body = await resp.json();
        $("api-status").textContent = body.api.reachable
          ? "API " + (body.api.status === 200 ? "ready" : "busy")
          : "API unreachable";
      } catch (e) {
        $("api-status").textContent = "dashboard unreachable";
      }
    }

    refreshSession();
    refreshHealth();
    setInterval(refreshHealth, 5000);
  </script>
</body>

</html>
"#;
